//! User lookup and privilege dropping.

use nix::unistd::{self, Uid, User};

use crate::error::SupervisorError;

/// Resolve a user name (or decimal uid) into a uid.
pub fn name_to_uid(name: &str) -> Result<Uid, SupervisorError> {
    if let Ok(uid) = name.parse::<u32>() {
        let uid = Uid::from_raw(uid);
        return match User::from_uid(uid) {
            Ok(Some(_)) => Ok(uid),
            _ => Err(SupervisorError::InvalidUser { user: name.to_string() }),
        };
    }
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid),
        _ => Err(SupervisorError::InvalidUser { user: name.to_string() }),
    }
}

/// Drop privileges to the given uid.
///
/// Returns `None` on success or a message describing why privileges
/// could not be dropped. Running already as the target uid succeeds
/// without any change, so an unprivileged supervisor can "drop" to
/// its own user.
pub fn drop_privileges(uid: Uid) -> Option<String> {
    let current = unistd::getuid();
    if current == uid {
        return None;
    }
    if !current.is_root() {
        return Some("can't drop privilege as nonroot user".to_string());
    }

    let user = match User::from_uid(uid) {
        Ok(Some(user)) => user,
        _ => return Some(format!("can't find uid {uid}")),
    };

    let name = match std::ffi::CString::new(user.name.clone()) {
        Ok(name) => name,
        Err(_) => return Some(format!("invalid user name for uid {uid}")),
    };
    match unistd::getgrouplist(&name, user.gid) {
        Ok(mut groups) => {
            // Keep the primary gid first; some platforms overwrite the
            // first supplementary group on the subsequent setgid.
            groups.retain(|gid| *gid != user.gid);
            groups.insert(0, user.gid);
            if unistd::setgroups(&groups).is_err() {
                return Some("could not set groups of effective user".to_string());
            }
        }
        Err(_) => return Some("could not look up groups of effective user".to_string()),
    }

    if unistd::setgid(user.gid).is_err() {
        return Some("could not set group id of effective user".to_string());
    }
    if unistd::setuid(uid).is_err() {
        return Some("could not set user id of effective user".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_to_uid_rejects_unknown_user() {
        assert!(name_to_uid("no-such-user-negatory").is_err());
    }

    #[test]
    fn test_name_to_uid_accepts_current_uid() {
        let uid = unistd::getuid();
        let resolved = name_to_uid(&uid.as_raw().to_string()).unwrap();
        assert_eq!(resolved, uid);
    }

    #[test]
    fn test_drop_to_own_uid_is_a_no_op() {
        assert!(drop_privileges(unistd::getuid()).is_none());
    }
}
