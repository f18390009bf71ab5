//! Per-client-group authentication state machine.
//!
//! A client group is pinned to a single user and a single token type for its
//! whole lifetime. Connections re-present their token on every connect;
//! `update` linearizes those presentations (the connection awaits it before
//! dispatching anything downstream) and bumps `revision` only when the
//! effective auth actually changes, so downstream services can cheaply
//! detect staleness.

use std::sync::Arc;

use async_trait::async_trait;
use errors::{
    ErrorBody,
    ErrorBodyAnyhowExt,
};
use serde::Deserialize;

/// Decoded JWT claims we care about. Everything else in the token is opaque
/// to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JwtClaims {
    pub sub: Option<String>,
    #[serde(default)]
    pub iat: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Opaque { raw: String },
    Jwt { raw: String, decoded: JwtClaims },
}

impl Auth {
    pub fn raw(&self) -> &str {
        match self {
            Auth::Opaque { raw } => raw,
            Auth::Jwt { raw, .. } => raw,
        }
    }

    /// Decode a JWT's claims without verifying its signature. Verification
    /// is the user API server's job; the cache only needs the claims to
    /// enforce session pinning.
    pub fn decode_jwt(raw: String) -> anyhow::Result<Self> {
        let mut parts = raw.split('.');
        let (Some(_header), Some(payload), Some(_sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("Token is not a JWT");
        };
        let bytes = base64_decode_url(payload)?;
        let decoded: JwtClaims = serde_json::from_slice(&bytes)?;
        Ok(Auth::Jwt { raw, decoded })
    }
}

fn base64_decode_url(s: &str) -> anyhow::Result<Vec<u8>> {
    base64::decode_config(s, base64::URL_SAFE_NO_PAD)
        .map_err(|e| anyhow::anyhow!("Invalid JWT payload encoding: {e}"))
}

/// Legacy token verification hook. When configured, every presented token
/// passes through it before being adopted by the session.
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    async fn validate(&self, token: &str, user_id: &str) -> anyhow::Result<Auth>;
}

/// The stock legacy validator: decodes claims locally and defers signature
/// verification to the user API server.
pub struct UnverifiedJwtValidator;

#[async_trait]
impl TokenValidator for UnverifiedJwtValidator {
    async fn validate(&self, token: &str, _user_id: &str) -> anyhow::Result<Auth> {
        Auth::decode_jwt(token.to_owned())
    }
}

fn auth_equal(a: Option<&Auth>, b: Option<&Auth>) -> bool {
    a == b
}

/// Outcome of a session update: `Err` carries the wire error to send to the
/// client, with the session unchanged.
pub type UpdateResult = Result<(), ErrorBody>;

pub struct AuthSession {
    auth: Option<Auth>,
    bound_user_id: Option<String>,
    revision: u64,
    validator: Option<Arc<dyn TokenValidator>>,
}

impl AuthSession {
    pub fn new(validator: Option<Arc<dyn TokenValidator>>) -> Self {
        Self {
            auth: None,
            bound_user_id: None,
            revision: 0,
            validator,
        }
    }

    pub fn auth(&self) -> Option<&Auth> {
        self.auth.as_ref()
    }

    pub fn raw_token(&self) -> Option<&str> {
        self.auth.as_ref().map(Auth::raw)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn bound_user_id(&self) -> Option<&str> {
        self.bound_user_id.as_deref()
    }

    /// Present `(user_id, wire_auth)` to the session. Identical inputs are
    /// idempotent: same opaque token ⇒ no revision change.
    pub async fn update(&mut self, user_id: &str, wire_auth: Option<&str>) -> anyhow::Result<UpdateResult> {
        if let Some(bound) = &self.bound_user_id {
            if bound != user_id {
                return Ok(Err(ErrorBody::unauthorized(
                    "Client groups are pinned to a single user",
                )));
            }
        }
        let provided = wire_auth.filter(|t| !t.is_empty());
        if provided.is_none() && self.auth.is_some() {
            return Ok(Err(ErrorBody::unauthorized(
                "No token provided. An unauthenticated client cannot connect to an \
                 authenticated client group",
            )));
        }
        let next_auth = match provided {
            None => None,
            Some(token) => match &self.validator {
                Some(validator) => match validator.validate(token, user_id).await {
                    Ok(validated) => match pick_token(self.auth.as_ref(), validated) {
                        Ok(next) => Some(next),
                        Err(body) => return Ok(Err(body)),
                    },
                    Err(e) => {
                        let body = match e.error_body() {
                            Some(body) => body.clone(),
                            None => ErrorBody::auth_invalidated(format!(
                                "Token validation failed: {e:#}"
                            )),
                        };
                        return Ok(Err(body));
                    },
                },
                None => {
                    anyhow::ensure!(
                        !matches!(self.auth, Some(Auth::Jwt { .. })),
                        "An opaque token cannot replace a JWT on client group {:?}",
                        self.bound_user_id
                    );
                    Some(Auth::Opaque {
                        raw: token.to_owned(),
                    })
                },
            },
        };
        if !auth_equal(self.auth.as_ref(), next_auth.as_ref()) {
            self.revision += 1;
            crate::metrics::log_auth_revision();
        }
        self.auth = next_auth;
        if self.bound_user_id.is_none() {
            self.bound_user_id = Some(user_id.to_owned());
        }
        Ok(Ok(()))
    }

    /// Reset everything, including the user binding and revision.
    pub fn clear(&mut self) {
        self.auth = None;
        self.bound_user_id = None;
        self.revision = 0;
    }
}

/// Decide between the session's current token and a newly validated one.
/// Token types and `sub` are immutable across updates; fresher `iat` wins,
/// ties keep the existing token.
pub fn pick_token(prev: Option<&Auth>, new: Auth) -> Result<Auth, ErrorBody> {
    let Some(prev) = prev else {
        return Ok(new);
    };
    match (prev, &new) {
        (Auth::Opaque { .. }, Auth::Opaque { .. }) => Ok(new),
        (Auth::Jwt { decoded: a, .. }, Auth::Jwt { decoded: b, .. }) => {
            if a.sub != b.sub {
                return Err(ErrorBody::unauthorized(
                    "The user id of a client group cannot change",
                ));
            }
            match (a.iat, b.iat) {
                (None, _) => Ok(new),
                (Some(_), None) => Err(ErrorBody::unauthorized(
                    "Cannot replace a token that has an issued-at time with one that does not",
                )),
                (Some(prev_iat), Some(new_iat)) => {
                    if new_iat > prev_iat {
                        Ok(new)
                    } else {
                        Ok(prev.clone())
                    }
                },
            }
        },
        _ => Err(ErrorBody::unauthorized(
            "The token type of a client group cannot change",
        )),
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorKind;
    use must_let::must_let;
    use proptest::prelude::*;

    use super::{
        pick_token,
        Auth,
        AuthSession,
        JwtClaims,
    };

    fn jwt(sub: &str, iat: Option<u64>) -> Auth {
        Auth::Jwt {
            raw: format!("jwt-{sub}-{iat:?}"),
            decoded: JwtClaims {
                sub: Some(sub.to_owned()),
                iat,
            },
        }
    }

    #[tokio::test]
    async fn test_session_replay() -> anyhow::Result<()> {
        let mut session = AuthSession::new(None);

        must_let!(let Ok(()) = session.update("u1", Some("t1")).await?);
        assert_eq!(session.revision(), 1);
        assert_eq!(session.bound_user_id(), Some("u1"));

        // Same opaque token: idempotent.
        must_let!(let Ok(()) = session.update("u1", Some("t1")).await?);
        assert_eq!(session.revision(), 1);

        // Empty token on an authenticated group.
        must_let!(let Err(body) = session.update("u1", Some("")).await?);
        assert_eq!(body.kind, ErrorKind::Unauthorized);
        assert!(body.message.starts_with("No token provided"));
        assert_eq!(session.revision(), 1);

        // Different user on a pinned group.
        must_let!(let Err(body) = session.update("u2", Some("t2")).await?);
        assert_eq!(body.kind, ErrorKind::Unauthorized);
        assert!(body.message.starts_with("Client groups are pinned"));
        assert_eq!(session.revision(), 1);

        // A different token for the same user is adopted.
        must_let!(let Ok(()) = session.update("u1", Some("t2")).await?);
        assert_eq!(session.revision(), 2);

        session.clear();
        assert_eq!(session.revision(), 0);
        assert_eq!(session.bound_user_id(), None);
        must_let!(let Ok(()) = session.update("u2", None).await?);
        assert_eq!(session.revision(), 0);
        assert_eq!(session.bound_user_id(), Some("u2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unauthenticated_to_authenticated_exactly_once() -> anyhow::Result<()> {
        let mut session = AuthSession::new(None);
        must_let!(let Ok(()) = session.update("u1", None).await?);
        assert_eq!(session.revision(), 0);
        // Unauthenticated -> authenticated is allowed once.
        must_let!(let Ok(()) = session.update("u1", Some("t1")).await?);
        assert_eq!(session.revision(), 1);
        // ...and back down is not.
        must_let!(let Err(_) = session.update("u1", None).await?);
        Ok(())
    }

    #[test]
    fn test_pick_token_rules() {
        // Fresher iat wins.
        must_let!(let Ok(Auth::Jwt { decoded, .. }) =
            pick_token(Some(&jwt("u1", Some(10))), jwt("u1", Some(20))));
        assert_eq!(decoded.iat, Some(20));

        // Equal or older iat keeps the existing token.
        must_let!(let Ok(picked) = pick_token(Some(&jwt("u1", Some(10))), jwt("u1", Some(10))));
        assert_eq!(picked, jwt("u1", Some(10)));
        must_let!(let Ok(picked) = pick_token(Some(&jwt("u1", Some(10))), jwt("u1", Some(5))));
        assert_eq!(picked, jwt("u1", Some(10)));

        // No iat on the existing token: accept the new one.
        must_let!(let Ok(picked) = pick_token(Some(&jwt("u1", None)), jwt("u1", Some(5))));
        assert_eq!(picked, jwt("u1", Some(5)));

        // iat present before but missing now: reject.
        must_let!(let Err(_) = pick_token(Some(&jwt("u1", Some(10))), jwt("u1", None)));

        // Subject changes: reject.
        must_let!(let Err(_) = pick_token(Some(&jwt("u1", Some(10))), jwt("u2", Some(20))));

        // Type changes: reject.
        must_let!(let Err(_) = pick_token(
            Some(&jwt("u1", Some(10))),
            Auth::Opaque { raw: "t".to_owned() },
        ));
    }

    fn arb_auth() -> impl Strategy<Value = Auth> {
        prop_oneof![
            "[a-z]{1,8}".prop_map(|raw| Auth::Opaque { raw }),
            (
                "[a-z]{1,4}",
                proptest::option::of(0u64..100),
                "[a-z]{1,8}",
            )
                .prop_map(|(sub, iat, raw)| Auth::Jwt {
                    raw,
                    decoded: JwtClaims {
                        sub: Some(sub),
                        iat,
                    },
                }),
        ]
    }

    proptest! {
        #[test]
        fn proptest_pick_token_idempotent(auth in arb_auth()) {
            // Presenting the token the session already holds never changes it.
            prop_assert_eq!(pick_token(Some(&auth), auth.clone()), Ok(auth));
        }

        #[test]
        fn proptest_pick_token_preserves_sub(a in arb_auth(), b in arb_auth()) {
            if let (Auth::Jwt { decoded: prev, .. }, Ok(Auth::Jwt { decoded: picked, .. })) =
                (&a, pick_token(Some(&a), b))
            {
                prop_assert_eq!(&prev.sub, &picked.sub);
            }
        }
    }
}
