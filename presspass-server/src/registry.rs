//! Identity registry: resolves and creates local subject records.
//!
//! Registration is closed by default and opened only through a scoped
//! override. The override is an RAII guard that re-closes registration on
//! drop, so no exit path (including errors) can leave the bypass stuck on.
//! Overrides are reference counted: registration stays open while any
//! guard is alive and closes only when the last one drops.

use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;

use crate::db::{Db, SubjectRow};
use crate::error::RegistryError;

pub struct Registry {
    db: Mutex<Db>,
    override_depth: AtomicUsize,
}

/// Scoped registration override. Holds one reference on the open count;
/// dropping it releases that reference, whatever path execution took.
pub struct RegistrationOverride<'a> {
    registry: &'a Registry,
}

impl Drop for RegistrationOverride<'_> {
    fn drop(&mut self) {
        self.registry.override_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Registry {
    pub fn new(db: Db) -> Self {
        Self {
            db: Mutex::new(db),
            override_depth: AtomicUsize::new(0),
        }
    }

    /// Open registration until the returned guard drops. Guards from
    /// concurrent callers stack; this one closing does not close theirs.
    pub fn allow_registration(&self) -> RegistrationOverride<'_> {
        self.override_depth.fetch_add(1, Ordering::SeqCst);
        RegistrationOverride { registry: self }
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<SubjectRow>, RegistryError> {
        Ok(self.db.lock().find_subject_by_email(email)?)
    }

    /// Register a new reader. Fails unless a registration override is held.
    pub fn register_reader(&self, email: &str) -> Result<SubjectRow, RegistryError> {
        if self.override_depth.load(Ordering::SeqCst) == 0 {
            return Err(RegistryError::RegistrationClosed);
        }
        let db = self.db.lock();
        let now = chrono::Utc::now().timestamp();
        let id = db.insert_subject(email, "reader", now)?;
        tracing::info!(%email, id, "registered new reader");
        Ok(db
            .find_subject_by_id(id)?
            .expect("row exists immediately after insert"))
    }

    /// Bind the token subject id to a subject. First write wins.
    pub fn bind_external_sub(&self, subject_id: i64, sub: &str) -> Result<(), RegistryError> {
        Ok(self.db.lock().bind_external_sub(subject_id, sub)?)
    }

    /// Create a fresh site session for the subject and return its token.
    pub fn set_current_session(&self, subject_id: i64) -> Result<String, RegistryError> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        self.db
            .lock()
            .insert_session(&token, subject_id, chrono::Utc::now().timestamp())?;
        Ok(token)
    }

    pub fn subject_for_session(&self, token: &str) -> Result<Option<SubjectRow>, RegistryError> {
        Ok(self.db.lock().subject_for_session(token)?)
    }

    /// Promote or demote a subject. Elevated roles never receive reader
    /// entitlements through the exchange path.
    pub fn set_role(&self, subject_id: i64, role: &str) -> Result<(), RegistryError> {
        Ok(self.db.lock().set_role(subject_id, role)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(Db::open_in_memory().unwrap())
    }

    #[test]
    fn registration_closed_by_default() {
        let r = registry();
        assert!(matches!(
            r.register_reader("reader@example.com"),
            Err(RegistryError::RegistrationClosed)
        ));
    }

    #[test]
    fn override_opens_and_guard_recloses() {
        let r = registry();
        {
            let _guard = r.allow_registration();
            r.register_reader("a@example.com").unwrap();
        }
        assert!(matches!(
            r.register_reader("b@example.com"),
            Err(RegistryError::RegistrationClosed)
        ));
    }

    #[test]
    fn override_released_on_error_path() {
        let r = registry();
        {
            let _guard = r.allow_registration();
            r.register_reader("a@example.com").unwrap();
            // Duplicate email errors out of the scope holding the guard.
            assert!(r.register_reader("a@example.com").is_err());
        }
        assert!(matches!(
            r.register_reader("c@example.com"),
            Err(RegistryError::RegistrationClosed)
        ));
    }

    #[test]
    fn overlapping_overrides_do_not_close_each_other() {
        let r = registry();
        let first = r.allow_registration();
        let second = r.allow_registration();
        // One concurrent scope finishing must not close the other's.
        drop(first);
        r.register_reader("a@example.com").unwrap();
        drop(second);
        assert!(matches!(
            r.register_reader("b@example.com"),
            Err(RegistryError::RegistrationClosed)
        ));
    }

    #[test]
    fn session_round_trip() {
        let r = registry();
        let subject = {
            let _guard = r.allow_registration();
            r.register_reader("reader@example.com").unwrap()
        };
        let token = r.set_current_session(subject.id).unwrap();
        let found = r.subject_for_session(&token).unwrap().unwrap();
        assert_eq!(found.id, subject.id);
        assert!(r.subject_for_session("bogus").unwrap().is_none());
    }
}
