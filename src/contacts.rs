use serde::{Deserialize, Serialize};

/// Vendor shape returned by the customer batch-get endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCustomer {
    pub external_userid: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub gender: Option<i64>,
    #[serde(default)]
    pub unionid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Unknown,
    Male,
    Female,
}

impl From<i64> for Gender {
    fn from(code: i64) -> Self {
        match code {
            1 => Gender::Male,
            2 => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

/// Normalized contact projection persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub avatar: String,
    pub gender: Gender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub union_id: Option<String>,
}

pub fn normalize_contact(raw: &RawCustomer) -> Contact {
    Contact {
        id: raw.external_userid.clone(),
        name: raw.nickname.clone(),
        avatar: raw.avatar.clone(),
        gender: raw.gender.map(Gender::from).unwrap_or(Gender::Unknown),
        union_id: raw.unionid.clone(),
    }
}
