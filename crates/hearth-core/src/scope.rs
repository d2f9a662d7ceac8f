//! Scope resolution: map a declared scope (+ optional person identifier)
//! to the concrete principal set and extra filters for an outbound tool
//! call.
//!
//! There is deliberately no relation table here ("son" → "Jack"); the
//! resolver only consults what the LLM emitted and what the household view
//! contains.

use hearth_types::household::HouseholdView;
use hearth_types::scope::{Scope, ScopeTarget};
use uuid::Uuid;

/// Self-references that resolve to the current principal.
const SELF_ALIASES: [&str; 2] = ["我", "我的"];

/// Why a personal-scope resolution failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeResolutionError {
    /// No person identifier was given for `scope=personal`.
    MissingPerson,
    /// The identifier matched no member key or display name.
    UnknownPerson(String),
    /// The member exists but has no bound principal.
    NoAccounts(String),
}

impl std::fmt::Display for ScopeResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeResolutionError::MissingPerson => write!(f, "personal scope without a person"),
            ScopeResolutionError::UnknownPerson(p) => write!(f, "unknown person '{p}'"),
            ScopeResolutionError::NoAccounts(p) => write!(f, "person '{p}' has no accounts"),
        }
    }
}

/// Stateless resolver configured with the family principal set.
#[derive(Debug, Clone)]
pub struct ScopeResolver {
    family_user_ids: Vec<Uuid>,
}

impl ScopeResolver {
    pub fn new(family_user_ids: Vec<Uuid>) -> Self {
        Self { family_user_ids }
    }

    /// The configured family principal set, merged with whatever the
    /// household view contributed.
    pub fn family_set(&self, household: &HouseholdView) -> Vec<Uuid> {
        let mut ids = self.family_user_ids.clone();
        for id in &household.family_scope_user_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    /// Resolve a scope to user ids + extra filters.
    pub fn resolve(
        &self,
        scope: Scope,
        person_or_key: Option<&str>,
        current_principal: Uuid,
        thread_id: Option<&str>,
        household: &HouseholdView,
    ) -> Result<ScopeTarget, ScopeResolutionError> {
        match scope {
            Scope::Family => Ok(ScopeTarget {
                user_ids: self.family_set(household),
                thread_filter: None,
            }),
            Scope::Thread => Ok(ScopeTarget {
                user_ids: vec![current_principal],
                thread_filter: thread_id.map(str::to_string),
            }),
            Scope::Personal => {
                let identifier = person_or_key
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(ScopeResolutionError::MissingPerson)?;

                if SELF_ALIASES.contains(&identifier) {
                    return Ok(ScopeTarget {
                        user_ids: vec![current_principal],
                        thread_filter: None,
                    });
                }

                let member = household
                    .find_member(identifier)
                    .ok_or_else(|| ScopeResolutionError::UnknownPerson(identifier.to_string()))?;
                if member.user_ids.is_empty() {
                    return Err(ScopeResolutionError::NoAccounts(identifier.to_string()));
                }
                Ok(ScopeTarget {
                    user_ids: member.user_ids.clone(),
                    thread_filter: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_types::household::HouseholdMember;
    use std::collections::BTreeMap;

    fn household_with(jack: Uuid) -> HouseholdView {
        let member = HouseholdMember {
            member_key: "child_1".to_string(),
            display_name: "Jack".to_string(),
            role: Some("child".to_string()),
            life_status: None,
            profile: serde_json::json!({}),
            user_ids: vec![jack],
        };
        HouseholdView {
            members: vec![member.clone()],
            members_index: BTreeMap::from([("child_1".to_string(), member)]),
            family_scope_user_ids: vec![jack],
            ..Default::default()
        }
    }

    #[test]
    fn test_family_scope_unions_config_and_household() {
        let configured = Uuid::now_v7();
        let jack = Uuid::now_v7();
        let resolver = ScopeResolver::new(vec![configured]);
        let target = resolver
            .resolve(Scope::Family, None, Uuid::now_v7(), Some("t1"), &household_with(jack))
            .unwrap();

        assert!(target.user_ids.contains(&configured));
        assert!(target.user_ids.contains(&jack));
        assert_eq!(target.thread_filter, None, "family scope never adds a thread filter");
    }

    #[test]
    fn test_family_scope_identical_for_all_askers() {
        let configured = Uuid::now_v7();
        let jack = Uuid::now_v7();
        let resolver = ScopeResolver::new(vec![configured]);
        let household = household_with(jack);

        let from_dad = resolver
            .resolve(Scope::Family, None, Uuid::now_v7(), None, &household)
            .unwrap();
        let from_mom = resolver
            .resolve(Scope::Family, None, Uuid::now_v7(), None, &household)
            .unwrap();
        assert_eq!(from_dad.user_ids, from_mom.user_ids);
    }

    #[test]
    fn test_thread_scope_restricts_to_current_principal_and_thread() {
        let me = Uuid::now_v7();
        let resolver = ScopeResolver::new(vec![]);
        let target = resolver
            .resolve(Scope::Thread, None, me, Some("threema:abc"), &HouseholdView::default())
            .unwrap();
        assert_eq!(target.user_ids, vec![me]);
        assert_eq!(target.thread_filter.as_deref(), Some("threema:abc"));
    }

    #[test]
    fn test_personal_scope_self_alias() {
        let me = Uuid::now_v7();
        let resolver = ScopeResolver::new(vec![]);
        for alias in ["我", "我的"] {
            let target = resolver
                .resolve(Scope::Personal, Some(alias), me, None, &HouseholdView::default())
                .unwrap();
            assert_eq!(target.user_ids, vec![me]);
        }
    }

    #[test]
    fn test_personal_scope_by_member_key_and_display_name() {
        let jack = Uuid::now_v7();
        let resolver = ScopeResolver::new(vec![]);
        let household = household_with(jack);

        let by_key = resolver
            .resolve(Scope::Personal, Some("child_1"), Uuid::now_v7(), None, &household)
            .unwrap();
        assert_eq!(by_key.user_ids, vec![jack]);

        let by_name = resolver
            .resolve(Scope::Personal, Some("jack"), Uuid::now_v7(), None, &household)
            .unwrap();
        assert_eq!(by_name.user_ids, vec![jack]);
    }

    #[test]
    fn test_personal_scope_failures() {
        let resolver = ScopeResolver::new(vec![]);
        let household = household_with(Uuid::now_v7());

        assert_eq!(
            resolver.resolve(Scope::Personal, None, Uuid::now_v7(), None, &household),
            Err(ScopeResolutionError::MissingPerson)
        );
        assert_eq!(
            resolver.resolve(Scope::Personal, Some("  "), Uuid::now_v7(), None, &household),
            Err(ScopeResolutionError::MissingPerson)
        );
        assert_eq!(
            resolver.resolve(Scope::Personal, Some("grandpa"), Uuid::now_v7(), None, &household),
            Err(ScopeResolutionError::UnknownPerson("grandpa".to_string()))
        );
    }

    #[test]
    fn test_personal_scope_member_without_accounts() {
        let member = HouseholdMember {
            member_key: "baby".to_string(),
            display_name: "宝宝".to_string(),
            role: None,
            life_status: None,
            profile: serde_json::json!({}),
            user_ids: vec![],
        };
        let household = HouseholdView {
            members: vec![member.clone()],
            members_index: BTreeMap::from([("baby".to_string(), member)]),
            ..Default::default()
        };
        let resolver = ScopeResolver::new(vec![]);
        assert_eq!(
            resolver.resolve(Scope::Personal, Some("baby"), Uuid::now_v7(), None, &household),
            Err(ScopeResolutionError::NoAccounts("baby".to_string()))
        );
    }
}
