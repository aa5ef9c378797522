pub mod clusters;

use anyhow::{format_err, Error};
use nix::unistd::{Gid, Group, Uid, User};

pub use plm_buildcfg::{API_GROUP_NAME, API_USER_NAME};

/// Return User info for the main system user (``getpwnam_r(3)``)
pub fn api_user() -> Result<nix::unistd::User, Error> {
    if cfg!(test) {
        Ok(User::from_uid(Uid::current())?.expect("current user does not exist"))
    } else {
        User::from_name(API_USER_NAME)?
            .ok_or_else(|| format_err!("Unable to lookup '{}' user.", API_USER_NAME))
    }
}

/// Return Group info for the main system group (``getgrnam(3)``)
pub fn api_group() -> Result<nix::unistd::Group, Error> {
    if cfg!(test) {
        Ok(Group::from_gid(Gid::current())?.expect("current group does not exist"))
    } else {
        Group::from_name(API_GROUP_NAME)?
            .ok_or_else(|| format_err!("Unable to lookup '{}' group.", API_GROUP_NAME))
    }
}
