//! A typed eligibility predicate assembled from the registry.
//!
//! Store backends either evaluate the predicate directly
//! ([`EligibilityQuery::matches`]) or compile it to their own query
//! language with bound parameters.

use serde::{Deserialize, Serialize};

use crate::core::{Entity, EntityType, RunFilters, RunScope};
use crate::errors::UnknownStageError;
use crate::registry::{CountryGate, SoftDepToggles, StageRegistry};

/// Filters applied on top of the dependency predicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EligibilityFilter {
    /// Only entities assigned to this owner.
    pub owner_id: Option<String>,
    /// Only companies in one of these tiers.
    pub tiers: Option<Vec<String>>,
    /// Soft dependency activation.
    pub soft_deps: SoftDepToggles,
}

impl From<&RunFilters> for EligibilityFilter {
    fn from(filters: &RunFilters) -> Self {
        Self {
            owner_id: filters.owner_id.clone(),
            tiers: filters.tiers.clone(),
            soft_deps: filters.soft_deps.clone(),
        }
    }
}

/// Whose completion record satisfies a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencySubject {
    /// The entity itself.
    SameEntity,
    /// The entity's parent (a contact's company).
    Parent,
}

/// One resolved dependency of the queried stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyClause {
    /// The dependency stage code.
    pub stage: String,
    /// Whose record is checked.
    pub subject: DependencySubject,
}

/// Which side of the predicate a query selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Entities that may run the stage now.
    Eligible,
    /// Undecided entities that fail the stage's gate.
    GateRejected,
}

/// Read access to completion records needed to evaluate a query.
pub trait CompletionLookup {
    /// Returns true if any record exists for the key.
    fn is_decided(&self, pipeline_run_id: &str, entity_id: &str, stage: &str) -> bool;

    /// Returns true if the tenant has a dependency-satisfying record for
    /// the entity and stage in any run.
    fn is_satisfied(&self, tenant_id: &str, entity_id: &str, stage: &str) -> bool;
}

/// The eligibility predicate for one stage in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityQuery {
    /// The queried stage.
    pub stage: String,
    /// Entity type of the stage.
    pub entity_type: EntityType,
    /// Tenant, scope and run.
    pub scope: RunScope,
    /// Resolved dependencies.
    pub dependencies: Vec<DependencyClause>,
    /// Owner filter.
    pub owner_id: Option<String>,
    /// Tier filter, company stages only.
    pub tiers: Option<Vec<String>>,
    /// Stage gate.
    pub gate: Option<CountryGate>,
    /// Which entities to select.
    pub selection: Selection,
}

impl EligibilityQuery {
    /// Builds the eligibility predicate for `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStageError`] if the stage or one of its dependencies
    /// is not registered.
    pub fn eligible(
        registry: &StageRegistry,
        stage: &str,
        scope: &RunScope,
        filter: &EligibilityFilter,
    ) -> Result<Self, UnknownStageError> {
        let descriptor = registry.get(stage)?;
        let mut dependencies = Vec::new();
        for dep in registry.resolve_deps(stage, &filter.soft_deps)? {
            let dep_type = registry.get(&dep)?.entity_type;
            let subject = if dep_type == descriptor.entity_type {
                DependencySubject::SameEntity
            } else {
                DependencySubject::Parent
            };
            dependencies.push(DependencyClause { stage: dep, subject });
        }

        let tiers = match descriptor.entity_type {
            EntityType::Company => filter.tiers.clone(),
            EntityType::Contact => None,
        };

        Ok(Self {
            stage: descriptor.code.clone(),
            entity_type: descriptor.entity_type,
            scope: scope.clone(),
            dependencies,
            owner_id: filter.owner_id.clone(),
            tiers,
            gate: descriptor.gate.clone(),
            selection: Selection::Eligible,
        })
    }

    /// Builds the query selecting undecided entities that fail the gate.
    ///
    /// Returns `Ok(None)` for stages without a gate.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStageError`] if the stage is not registered.
    pub fn gate_rejected(
        registry: &StageRegistry,
        stage: &str,
        scope: &RunScope,
    ) -> Result<Option<Self>, UnknownStageError> {
        let descriptor = registry.get(stage)?;
        Ok(descriptor.gate.as_ref().map(|gate| Self {
            stage: descriptor.code.clone(),
            entity_type: descriptor.entity_type,
            scope: scope.clone(),
            dependencies: Vec::new(),
            owner_id: None,
            tiers: None,
            gate: Some(gate.clone()),
            selection: Selection::GateRejected,
        }))
    }

    /// Returns true if the gate subject of this stage is the parent entity.
    #[must_use]
    pub fn gate_uses_parent(&self) -> bool {
        self.entity_type == EntityType::Contact
    }

    /// Evaluates the predicate for one entity.
    ///
    /// `parent` must be the entity referenced by `entity.parent_id`, if any.
    pub fn matches(
        &self,
        entity: &Entity,
        parent: Option<&Entity>,
        lookup: &impl CompletionLookup,
    ) -> bool {
        if entity.tenant_id != self.scope.tenant_id
            || entity.scope_id != self.scope.scope_id
            || entity.entity_type != self.entity_type
        {
            return false;
        }
        if lookup.is_decided(&self.scope.pipeline_run_id, &entity.id, &self.stage) {
            return false;
        }

        let gate_subject = if self.gate_uses_parent() { parent } else { Some(entity) };

        match self.selection {
            Selection::GateRejected => self
                .gate
                .as_ref()
                .is_some_and(|gate| !gate.matches(gate_subject)),
            Selection::Eligible => {
                let deps_met = self.dependencies.iter().all(|dep| {
                    let subject_id = match dep.subject {
                        DependencySubject::SameEntity => Some(entity.id.as_str()),
                        DependencySubject::Parent => entity.parent_id.as_deref(),
                    };
                    subject_id.is_some_and(|id| {
                        lookup.is_satisfied(&self.scope.tenant_id, id, &dep.stage)
                    })
                });
                if !deps_met {
                    return false;
                }
                if let Some(owner) = &self.owner_id {
                    if entity.owner_id.as_ref() != Some(owner) {
                        return false;
                    }
                }
                if let Some(tiers) = &self.tiers {
                    if !entity.tier.as_ref().is_some_and(|tier| tiers.contains(tier)) {
                        return false;
                    }
                }
                self.gate.as_ref().map_or(true, |gate| gate.matches(gate_subject))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct Lookup {
        decided: HashSet<(String, String, String)>,
        satisfied: HashMap<(String, String), String>,
    }

    impl Lookup {
        fn decide(mut self, run: &str, entity: &str, stage: &str) -> Self {
            self.decided
                .insert((run.to_string(), entity.to_string(), stage.to_string()));
            self
        }

        fn satisfy(mut self, tenant: &str, entity: &str, stage: &str) -> Self {
            self.satisfied
                .insert((entity.to_string(), stage.to_string()), tenant.to_string());
            self
        }
    }

    impl CompletionLookup for Lookup {
        fn is_decided(&self, run: &str, entity: &str, stage: &str) -> bool {
            self.decided
                .contains(&(run.to_string(), entity.to_string(), stage.to_string()))
        }

        fn is_satisfied(&self, tenant: &str, entity: &str, stage: &str) -> bool {
            self.satisfied
                .get(&(entity.to_string(), stage.to_string()))
                .is_some_and(|t| t == tenant)
        }
    }

    fn scope() -> RunScope {
        RunScope::new("t1", "s1", "run1")
    }

    fn query(stage: &str, filter: &EligibilityFilter) -> EligibilityQuery {
        EligibilityQuery::eligible(&StageRegistry::builtin(), stage, &scope(), filter).unwrap()
    }

    #[test]
    fn test_dependency_subjects() {
        let q = query("generate", &EligibilityFilter::default());
        assert_eq!(
            q.dependencies,
            vec![
                DependencyClause {
                    stage: "person".to_string(),
                    subject: DependencySubject::SameEntity,
                },
                DependencyClause {
                    stage: "registry".to_string(),
                    subject: DependencySubject::Parent,
                },
            ]
        );
    }

    #[test]
    fn test_root_stage_matches_scope_only() {
        let q = query("l1", &EligibilityFilter::default());
        let lookup = Lookup::default();

        assert!(q.matches(&Entity::company("c1", "t1", "s1", "A"), None, &lookup));
        assert!(!q.matches(&Entity::company("c2", "t2", "s1", "B"), None, &lookup));
        assert!(!q.matches(&Entity::company("c3", "t1", "other", "C"), None, &lookup));
        assert!(!q.matches(&Entity::contact("p1", "t1", "s1", "P", "c1"), None, &lookup));
    }

    #[test]
    fn test_decided_entities_are_excluded() {
        let q = query("l1", &EligibilityFilter::default());
        let lookup = Lookup::default().decide("run1", "c1", "l1");

        assert!(!q.matches(&Entity::company("c1", "t1", "s1", "A"), None, &lookup));
    }

    #[test]
    fn test_cross_entity_dependency_uses_parent() {
        let q = query("person", &EligibilityFilter::default());
        let company = Entity::company("c1", "t1", "s1", "Acme");
        let contact = Entity::contact("p1", "t1", "s1", "Jane", "c1");

        assert!(!q.matches(&contact, Some(&company), &Lookup::default()));
        let lookup = Lookup::default().satisfy("t1", "c1", "l2");
        assert!(q.matches(&contact, Some(&company), &lookup));
    }

    #[test]
    fn test_owner_and_tier_filters() {
        let filter = EligibilityFilter {
            owner_id: Some("rep1".to_string()),
            tiers: Some(vec!["gold".to_string()]),
            ..Default::default()
        };
        let q = query("l1", &filter);
        let lookup = Lookup::default();

        let gold = Entity::company("c1", "t1", "s1", "A").with_owner("rep1").with_tier("gold");
        let silver = Entity::company("c2", "t1", "s1", "B").with_owner("rep1").with_tier("silver");
        let other_owner = Entity::company("c3", "t1", "s1", "C")
            .with_owner("rep2")
            .with_tier("gold");

        assert!(q.matches(&gold, None, &lookup));
        assert!(!q.matches(&silver, None, &lookup));
        assert!(!q.matches(&other_owner, None, &lookup));
    }

    #[test]
    fn test_tier_filter_ignored_for_contact_stages() {
        let filter = EligibilityFilter {
            tiers: Some(vec!["gold".to_string()]),
            ..Default::default()
        };
        assert!(query("person", &filter).tiers.is_none());
    }

    #[test]
    fn test_gate_selection_sides() {
        let registry = StageRegistry::builtin();
        let filter = EligibilityFilter {
            soft_deps: SoftDepToggles::new().disable("registry"),
            ..Default::default()
        };
        let eligible =
            EligibilityQuery::eligible(&registry, "registry", &scope(), &filter).unwrap();
        let rejected = EligibilityQuery::gate_rejected(&registry, "registry", &scope())
            .unwrap()
            .unwrap();
        let lookup = Lookup::default();

        let us = Entity::company("c1", "t1", "s1", "Acme")
            .with_country("US")
            .with_domain("acme.com");
        let cz = Entity::company("c2", "t1", "s1", "Firma").with_country("CZ");

        assert!(!eligible.matches(&us, None, &lookup));
        assert!(rejected.matches(&us, None, &lookup));
        assert!(eligible.matches(&cz, None, &lookup));
        assert!(!rejected.matches(&cz, None, &lookup));
    }

    #[test]
    fn test_gate_rejected_is_none_without_gate() {
        let q = EligibilityQuery::gate_rejected(&StageRegistry::builtin(), "l1", &scope()).unwrap();
        assert!(q.is_none());
    }
}
