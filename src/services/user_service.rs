//! User service - identity and profile bookkeeping
//!
//! Users are created on first contact with a generated referral code.
//! Codes are random, so creation retries with a fresh candidate whenever the
//! store reports a referral-code conflict.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::db::{users, EntitlementStore, Referral, User, UserProfile};
use crate::error::EntitlementError;

use super::events::{EntitlementEvent, EventBus};
use super::referral_service::{announce_referral, record_in};

/// Length of generated referral codes
pub const REFERRAL_CODE_LENGTH: usize = 8;

/// Attempts before giving up on finding an unused referral code
const MAX_CODE_ATTEMPTS: usize = 16;

const REFERRAL_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a random referral code from `A-Z0-9`
pub fn generate_referral_code() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LENGTH)
        .map(|_| REFERRAL_CODE_ALPHABET[rng.gen_range(0..REFERRAL_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Outcome of a first or repeat contact
#[derive(Debug, Clone)]
pub struct Registration {
    pub user: User,
    /// True when this contact created the user
    pub created: bool,
    /// Referral recorded for a newly created user
    pub referral: Option<Referral>,
}

impl Registration {
    fn existing(user: User) -> Self {
        Self {
            user,
            created: false,
            referral: None,
        }
    }
}

pub struct UserService {
    store: Arc<EntitlementStore>,
    events: Arc<EventBus>,
    code_generator: fn() -> String,
}

impl UserService {
    pub fn new(store: Arc<EntitlementStore>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            events,
            code_generator: generate_referral_code,
        }
    }

    /// Replace the referral code source
    pub fn with_code_generator(mut self, generator: fn() -> String) -> Self {
        self.code_generator = generator;
        self
    }

    /// Get the user for `external_id`, creating it on first contact.
    ///
    /// Existing users get their profile fields refreshed in place. The flag
    /// is true when the user was created by this call.
    pub fn get_or_create(
        &self,
        external_id: i64,
        profile: &UserProfile,
    ) -> Result<(User, bool), EntitlementError> {
        let registration = self.register(external_id, profile, None)?;
        Ok((registration.user, registration.created))
    }

    /// [`Self::get_or_create`], crediting the owner of `referral_code` when
    /// the user is new.
    ///
    /// The user row and the referral commit together: if recording the
    /// referral fails, the user is not created either and a retry is again a
    /// first contact. Unknown codes are ignored.
    pub fn register(
        &self,
        external_id: i64,
        profile: &UserProfile,
        referral_code: Option<&str>,
    ) -> Result<Registration, EntitlementError> {
        let now = Utc::now();

        let (registration, referral_created) = self.store.with_tx(|tx| {
            if let Some(existing) = users::find_by_external_id(tx, external_id)? {
                let user = if users::update_profile(tx, &existing, profile, now)? {
                    debug!(user_id = existing.id, "Updated user profile");
                    users::get_user(tx, existing.id)?
                        .ok_or_else(|| EntitlementError::not_found("User", existing.id))?
                } else {
                    existing
                };
                return Ok((Registration::existing(user), false));
            }

            let user = self.insert_with_fresh_code(tx, external_id, profile, now)?;

            let referrer = match referral_code {
                Some(code) => {
                    let referrer = users::find_by_referral_code(tx, code)?;
                    if referrer.is_none() {
                        debug!(code, "Unknown referral code");
                    }
                    referrer
                }
                None => None,
            };
            let (referral, referral_created) = match referrer {
                Some(referrer) => {
                    let (referral, created) = record_in(tx, referrer.id, user.id, now)?;
                    (Some(referral), created)
                }
                None => (None, false),
            };

            Ok((
                Registration {
                    user,
                    created: true,
                    referral,
                },
                referral_created,
            ))
        })?;

        if registration.created {
            info!(user_id = registration.user.id, external_id, "Created user");
            self.events.emit(EntitlementEvent::UserCreated {
                user_id: registration.user.id,
                external_id,
            });
        }
        if let Some(referral) = &registration.referral {
            announce_referral(&self.events, referral, referral_created);
        }

        Ok(registration)
    }

    fn insert_with_fresh_code(
        &self,
        conn: &Connection,
        external_id: i64,
        profile: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<User, EntitlementError> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = (self.code_generator)();
            match users::insert_user(conn, external_id, profile, &code, now) {
                Ok(user) => return Ok(user),
                Err(EntitlementError::Conflict(columns)) if columns.contains("referral_code") => {
                    warn!(attempt, "Referral code collision, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(EntitlementError::Conflict(format!(
            "no unused referral code after {} attempts",
            MAX_CODE_ATTEMPTS
        )))
    }

    pub fn get(&self, user_id: i64) -> Result<Option<User>, EntitlementError> {
        self.store.with_conn(|conn| users::get_user(conn, user_id))
    }

    pub fn find_by_external_id(&self, external_id: i64) -> Result<Option<User>, EntitlementError> {
        self.store.with_conn(|conn| users::find_by_external_id(conn, external_id))
    }

    /// Like [`Self::find_by_external_id`] but missing users are `NotFound`
    pub fn require_by_external_id(&self, external_id: i64) -> Result<User, EntitlementError> {
        self.find_by_external_id(external_id)?
            .ok_or_else(|| EntitlementError::not_found("User", external_id))
    }

    pub fn find_by_referral_code(&self, code: &str) -> Result<Option<User>, EntitlementError> {
        self.store.with_conn(|conn| users::find_by_referral_code(conn, code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> UserService {
        service_with_store().0
    }

    fn service_with_store() -> (UserService, Arc<EntitlementStore>) {
        let store = Arc::new(EntitlementStore::open_in_memory().unwrap());
        (UserService::new(store.clone(), Arc::new(EventBus::new())), store)
    }

    #[test]
    fn test_generated_code_shape() {
        let code = generate_referral_code();
        assert_eq!(code.len(), REFERRAL_CODE_LENGTH);
        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let service = service();
        let profile = UserProfile {
            username: Some("lina".into()),
            ..Default::default()
        };

        let (first, created) = service.get_or_create(10, &profile).unwrap();
        assert!(created);
        assert_eq!(first.language_code, "ar");

        let (second, created) = service.get_or_create(10, &profile).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(first.referral_code, second.referral_code);
    }

    #[test]
    fn test_profile_refreshed_on_contact() {
        let service = service();
        service.get_or_create(10, &UserProfile::default()).unwrap();

        let renamed = UserProfile {
            username: Some("new_name".into()),
            language_code: Some("en".into()),
            ..Default::default()
        };
        let (user, _) = service.get_or_create(10, &renamed).unwrap();
        assert_eq!(user.username.as_deref(), Some("new_name"));
        assert_eq!(user.language_code, "en");
    }

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn colliding_then_fresh() -> String {
        // Calls two and three collide with the first user's code
        if CALLS.fetch_add(1, Ordering::SeqCst) < 3 {
            "TAKEN000".to_string()
        } else {
            "FRESH000".to_string()
        }
    }

    #[test]
    fn test_referral_code_collision_retries() {
        let service = service().with_code_generator(colliding_then_fresh);

        let (first, _) = service.get_or_create(1, &UserProfile::default()).unwrap();
        assert_eq!(first.referral_code, "TAKEN000");

        let (second, created) = service.get_or_create(2, &UserProfile::default()).unwrap();
        assert!(created);
        assert_eq!(second.referral_code, "FRESH000");
    }

    #[test]
    fn test_register_records_referral_for_new_user_only() {
        let service = service();
        let referrer = service.register(1, &UserProfile::default(), None).unwrap().user;

        let first = service
            .register(2, &UserProfile::default(), Some(&referrer.referral_code))
            .unwrap();
        assert!(first.created);
        let referral = first.referral.unwrap();
        assert_eq!(referral.referrer_id, referrer.id);
        assert_eq!(referral.referred_id, first.user.id);

        let again = service
            .register(2, &UserProfile::default(), Some(&referrer.referral_code))
            .unwrap();
        assert!(!again.created);
        assert!(again.referral.is_none());

        let unknown = service.register(3, &UserProfile::default(), Some("NOPE0000")).unwrap();
        assert!(unknown.created);
        assert!(unknown.referral.is_none());
    }

    #[test]
    fn test_failed_referral_rolls_back_user_creation() {
        let (service, store) = service_with_store();
        let referrer = service.register(1, &UserProfile::default(), None).unwrap().user;

        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER referrals_offline BEFORE INSERT ON referrals
                     BEGIN SELECT RAISE(ABORT, 'referral ledger unavailable'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        let failed = service.register(2, &UserProfile::default(), Some(&referrer.referral_code));
        assert!(failed.is_err());
        assert!(service.find_by_external_id(2).unwrap().is_none());

        store
            .with_conn(|conn| {
                conn.execute_batch("DROP TRIGGER referrals_offline")?;
                Ok(())
            })
            .unwrap();

        let retried = service
            .register(2, &UserProfile::default(), Some(&referrer.referral_code))
            .unwrap();
        assert!(retried.created);
        assert_eq!(retried.referral.unwrap().referrer_id, referrer.id);
    }

    #[test]
    fn test_require_missing_user() {
        let service = service();
        assert!(matches!(
            service.require_by_external_id(404),
            Err(EntitlementError::NotFound { entity: "User", .. })
        ));
    }
}
