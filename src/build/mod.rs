//! Build toolchain adapter
//!
//! - `xcodebuild`: archive, export, project introspection and versioning
//! - `export_options`: the export options property list

mod export_options;
mod xcodebuild;

pub use export_options::{export_options_plist, write_export_options};
pub use xcodebuild::{
    Xcodebuild, find_package, parse_build_settings, parse_scheme_list, project_flag,
};
