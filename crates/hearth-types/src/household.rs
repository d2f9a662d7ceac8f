//! Household view: the structure the scope resolver and prompts consume.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// One household (a family).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Household {
    pub id: Uuid,
    pub slug: String,
    pub display_name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Free-form configuration: timezone, seasonal hints, contacts.
    #[serde(default)]
    pub config: Value,
}

/// One member of a household, with its bound principal ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HouseholdMember {
    pub member_key: String,
    pub display_name: String,

    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub life_status: Option<String>,

    #[serde(default)]
    pub profile: Value,

    #[serde(default)]
    pub user_ids: Vec<Uuid>,
}

/// Aggregated view handed to the scope resolver and the prompt payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HouseholdView {
    #[serde(default)]
    pub households: Vec<Household>,

    #[serde(default)]
    pub members: Vec<HouseholdMember>,

    /// `member_key -> member`, the primary lookup surface.
    #[serde(default)]
    pub members_index: BTreeMap<String, HouseholdMember>,

    /// Union of configured shared ids, member account ids, and the
    /// `family_default` principal.
    #[serde(default)]
    pub family_scope_user_ids: Vec<Uuid>,
}

impl HouseholdView {
    /// Look a member up by key, falling back to a case-insensitive display
    /// name match.
    pub fn find_member(&self, identifier: &str) -> Option<&HouseholdMember> {
        if let Some(member) = self.members_index.get(identifier) {
            return Some(member);
        }
        let lower = identifier.to_lowercase();
        self.members
            .iter()
            .find(|m| m.display_name.to_lowercase() == lower)
    }

    /// The household timezone, when one is configured.
    pub fn timezone(&self) -> Option<&str> {
        self.households
            .iter()
            .find_map(|h| h.config.get("timezone").and_then(Value::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member(key: &str, name: &str, user_id: Uuid) -> HouseholdMember {
        HouseholdMember {
            member_key: key.to_string(),
            display_name: name.to_string(),
            role: None,
            life_status: None,
            profile: json!({}),
            user_ids: vec![user_id],
        }
    }

    #[test]
    fn test_find_member_by_key_then_display_name() {
        let jack = Uuid::now_v7();
        let m = member("child_1", "Jack", jack);
        let view = HouseholdView {
            members: vec![m.clone()],
            members_index: BTreeMap::from([("child_1".to_string(), m)]),
            ..Default::default()
        };

        assert_eq!(view.find_member("child_1").unwrap().user_ids, vec![jack]);
        assert_eq!(view.find_member("jack").unwrap().user_ids, vec![jack]);
        assert_eq!(view.find_member("JACK").unwrap().user_ids, vec![jack]);
        assert!(view.find_member("unknown").is_none());
    }

    #[test]
    fn test_timezone_from_household_config() {
        let view = HouseholdView {
            households: vec![Household {
                id: Uuid::now_v7(),
                slug: "primary".to_string(),
                display_name: "家庭".to_string(),
                description: None,
                config: json!({"timezone": "Asia/Shanghai"}),
            }],
            ..Default::default()
        };
        assert_eq!(view.timezone(), Some("Asia/Shanghai"));
        assert_eq!(HouseholdView::default().timezone(), None);
    }
}
