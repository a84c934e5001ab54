//! Identifier helpers. Instance ids embed their owning session:
//! `{session_id}:{task_name}:{tick}`.

use uuid::Uuid;

use crate::error::{Result, TaskError};

pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn new_execution_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_client_id() -> String {
    format!("client-{}", Uuid::new_v4().simple())
}

pub fn instance_id(session_id: &str, task_name: &str, tick: u64) -> String {
    format!("{session_id}:{task_name}:{tick}")
}

/// The session id embedded in an instance id.
pub fn session_of(instance_id: &str) -> Option<&str> {
    instance_id
        .split_once(':')
        .map(|(session, _)| session)
        .filter(|session| !session.is_empty())
}

pub fn owns(instance_id: &str, session_id: &str) -> bool {
    session_of(instance_id) == Some(session_id)
}

pub fn validate_ownership(instance_id: &str, session_id: &str) -> Result<()> {
    if owns(instance_id, session_id) {
        Ok(())
    } else {
        Err(TaskError::SessionOwnership {
            session_id: session_id.to_string(),
            instance_id: instance_id.to_string(),
        })
    }
}

pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || session_id.contains(':') {
        return Err(TaskError::InvalidConfig(format!(
            "session id must be non-empty and must not contain ':', got {session_id:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_embed_their_session() {
        let id = instance_id("s1", "add", 7);
        assert_eq!(id, "s1:add:7");
        assert_eq!(session_of(&id), Some("s1"));
        assert!(owns(&id, "s1"));
        assert!(!owns(&id, "s10"));
        assert!(!owns(&id, "s"));
    }

    #[test]
    fn task_names_may_contain_separators() {
        let id = instance_id("s1", "pkg:add", 1);
        assert_eq!(session_of(&id), Some("s1"));
    }

    #[test]
    fn ownership_errors_name_both_ids() {
        let err = validate_ownership("s1:add:1", "s2").unwrap_err();
        assert_eq!(
            err,
            TaskError::SessionOwnership {
                session_id: "s2".into(),
                instance_id: "s1:add:1".into()
            }
        );
        assert!(validate_ownership(":add:1", "").is_err());
    }

    #[test]
    fn session_ids_reject_separator() {
        assert!(validate_session_id("abc").is_ok());
        assert!(validate_session_id("a:b").is_err());
        assert!(validate_session_id("").is_err());
    }
}
