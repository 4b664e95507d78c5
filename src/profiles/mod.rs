//! Provisioning profiles: parsing, installation and matching

mod matcher;
mod mobileprovision;

pub use matcher::{ProfileMatcher, find_compatible};
pub use mobileprovision::{
    PROFILE_EXTENSION, install_profile, installed_path, load_profiles, parse_mobileprovision,
    read_profile,
};
