use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use shipr_core::error::ShiprError;
use shipr_core::models::user::{IdentitySignal, User, UserId};
use shipr_core::Clock;
use shipr_db::{ops, Store};

/// Maps author/committer/reviewer signals onto canonical user rows.
///
/// Lookup order is remote id, then email, then login. A row found by email or
/// login that already carries a *different* remote id belongs to someone else
/// and is passed over. Matched rows only ever gain data: missing remote id,
/// email, login or avatar are filled in, existing values are kept.
pub struct IdentityResolver {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl IdentityResolver {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn ensure_user(&self, signal: &IdentitySignal) -> Result<UserId, ShiprError> {
        let now = self.clock.now();
        self.store
            .write(|tx| resolve(tx, signal, now))?
            .ok_or_else(|| {
                ShiprError::validation(format!(
                    "identity '{}' has no remote id, email or login",
                    signal.name
                ))
            })
    }
}

/// Resolve `signal` on an open connection, creating the user if nothing matches.
/// Returns `None` for signals that carry no usable key.
pub(crate) fn resolve(
    conn: &Connection,
    signal: &IdentitySignal,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<UserId>> {
    if !signal.is_resolvable() {
        return Ok(None);
    }
    let email = signal.normalized_email();
    let login = signal.normalized_login();

    if let Some(remote_id) = signal.remote_id {
        if let Some(user) = ops::find_user_by_remote_id(conn, remote_id)? {
            enrich(conn, &user, signal, email.as_deref(), login)?;
            return Ok(Some(user.id));
        }
    }

    let by_email = match email.as_deref() {
        Some(email) => ops::find_user_by_email(conn, email)?,
        None => None,
    };
    let by_login = match login {
        Some(login) => ops::find_user_by_login(conn, login)?,
        None => None,
    };

    for candidate in [by_email, by_login].into_iter().flatten() {
        let conflicting = matches!(
            (candidate.remote_id, signal.remote_id),
            (Some(stored), Some(incoming)) if stored != incoming
        );
        if conflicting {
            continue;
        }
        enrich(conn, &candidate, signal, email.as_deref(), login)?;
        return Ok(Some(candidate.id));
    }

    let user = User {
        id: UserId::new(),
        name: signal.name.clone(),
        email,
        login: login.map(str::to_string),
        remote_id: signal.remote_id,
        avatar_url: signal.avatar_url.clone(),
        created_at: now,
    };
    ops::insert_user(conn, &user)?;
    tracing::debug!("created user {} ({})", user.name, user.id);
    Ok(Some(user.id))
}

fn enrich(
    conn: &Connection,
    user: &User,
    signal: &IdentitySignal,
    email: Option<&str>,
    login: Option<&str>,
) -> anyhow::Result<()> {
    let gains = (user.remote_id.is_none() && signal.remote_id.is_some())
        || (user.email.is_none() && email.is_some())
        || (user.login.is_none() && login.is_some())
        || (user.avatar_url.is_none() && signal.avatar_url.is_some());
    if gains {
        ops::enrich_user(
            conn,
            &user.id,
            signal.remote_id,
            email,
            login,
            signal.avatar_url.as_deref(),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipr_core::ManualClock;

    fn resolver() -> (IdentityResolver, Arc<Store>) {
        let store = Arc::new(Store::open_memory().unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (IdentityResolver::new(store.clone(), clock), store)
    }

    fn users(store: &Store) -> Vec<User> {
        store.read(ops::list_users).unwrap()
    }

    #[test]
    fn test_first_writer_keeps_login_and_remote_id() {
        let (resolver, store) = resolver();
        let first = resolver
            .ensure_user(
                &IdentitySignal::new("A")
                    .with_email("a@x.com")
                    .with_login("a-login")
                    .with_remote_id(42)
                    .with_avatar("https://a/42.png"),
            )
            .unwrap();
        let second = resolver
            .ensure_user(
                &IdentitySignal::new("A2")
                    .with_email("a@x.com")
                    .with_login("a-login2"),
            )
            .unwrap();

        assert_eq!(first, second);
        let all = users(&store);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].remote_id, Some(42));
        assert_eq!(all[0].login.as_deref(), Some("a-login"));
    }

    #[test]
    fn test_stronger_signal_enriches_in_place() {
        let (resolver, store) = resolver();
        let by_email = resolver
            .ensure_user(&IdentitySignal::new("Ada").with_email("Ada@Example.com"))
            .unwrap();
        let by_account = resolver
            .ensure_user(
                &IdentitySignal::new("ada")
                    .with_email("ada@example.com")
                    .with_login("ada")
                    .with_remote_id(7)
                    .with_avatar("https://a/7.png"),
            )
            .unwrap();

        assert_eq!(by_email, by_account);
        let all = users(&store);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].email.as_deref(), Some("ada@example.com"));
        assert_eq!(all[0].remote_id, Some(7));
        assert_eq!(all[0].avatar_url.as_deref(), Some("https://a/7.png"));
    }

    #[test]
    fn test_remote_id_is_authoritative() {
        let (resolver, store) = resolver();
        let owner = resolver
            .ensure_user(&IdentitySignal::new("Ada").with_email("shared@x.com").with_remote_id(1))
            .unwrap();
        // Same email, different verified account: not merged.
        let other = resolver
            .ensure_user(&IdentitySignal::new("Bob").with_email("shared@x.com").with_remote_id(2))
            .unwrap();
        assert_ne!(owner, other);

        // Remote id wins over a mismatching email.
        let again = resolver
            .ensure_user(&IdentitySignal::new("Bob").with_email("bob@x.com").with_remote_id(2))
            .unwrap();
        assert_eq!(again, other);
        assert_eq!(users(&store).len(), 2);
    }

    #[test]
    fn test_single_row_per_remote_id_in_any_order() {
        let signals = [
            IdentitySignal::new("c").with_login("cy"),
            IdentitySignal::new("c").with_email("c@x.com").with_remote_id(9),
            IdentitySignal::new("c").with_login("CY").with_remote_id(9),
            IdentitySignal::new("c").with_email("C@X.com"),
        ];
        for rotation in 0..signals.len() {
            let (resolver, store) = resolver();
            for i in 0..signals.len() {
                resolver
                    .ensure_user(&signals[(rotation + i) % signals.len()])
                    .unwrap();
            }
            let with_id: Vec<_> = users(&store)
                .into_iter()
                .filter(|u| u.remote_id == Some(9))
                .collect();
            assert_eq!(with_id.len(), 1, "rotation {rotation}");
        }
    }

    #[test]
    fn test_login_match_is_case_insensitive() {
        let (resolver, store) = resolver();
        let a = resolver
            .ensure_user(&IdentitySignal::new("Dee").with_login("DeeDev"))
            .unwrap();
        let b = resolver
            .ensure_user(&IdentitySignal::new("dee").with_login("deedev"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(users(&store).len(), 1);
    }

    #[test]
    fn test_signal_without_keys_is_rejected() {
        let (resolver, store) = resolver();
        let err = resolver
            .ensure_user(&IdentitySignal::new("ghost"))
            .unwrap_err();
        assert!(matches!(err, ShiprError::Validation { .. }));
        assert!(users(&store).is_empty());
    }
}
