//! Server-side connection identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique id of one accepted socket.
pub type ConnectionId = String;

/// Role reported by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Driver,
    Owner,
    Passenger,
    #[serde(other)]
    Unknown,
}

/// Who is on the other end of a socket, when the client presented a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

/// Generate a unique connection id.
pub fn generate_connection_id() -> ConnectionId {
    format!("{}.{}", std::process::id(), Uuid::new_v4().as_simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("{}.", std::process::id())));
    }

    #[test]
    fn unknown_roles_decode() {
        let role: Role = serde_json::from_str("\"dispatcher\"").unwrap();
        assert_eq!(role, Role::Unknown);
        let role: Role = serde_json::from_str("\"driver\"").unwrap();
        assert_eq!(role, Role::Driver);
    }
}
