use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    SubAdmin,
    SuperAdmin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::SubAdmin | Role::SuperAdmin)
    }
}

// Tokens are issued by the auth service; we only verify them.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    #[serde(default = "default_role")]
    pub role: Role,
    pub exp: usize,
}

fn default_role() -> Role {
    Role::Client
}

impl Claims {
    pub fn buyer_id(&self) -> &str {
        &self.sub
    }
}
