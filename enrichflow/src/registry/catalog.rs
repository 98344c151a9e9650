//! The stage registry: an immutable catalog with dependency resolution and
//! topological ordering.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

use super::{CountryGate, SoftDepToggles, StageDescriptor};
use crate::core::EntityType;
use crate::errors::{CycleDetectedError, RegistryError, UnknownStageError};

/// Read-only lookup from stage code to descriptor.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: HashMap<String, StageDescriptor>,
    /// Declaration order, used for deterministic iteration.
    order: Vec<String>,
}

impl StageRegistry {
    /// Returns the shared built-in enrichment catalog.
    #[must_use]
    pub fn builtin() -> Arc<Self> {
        static BUILTIN: OnceLock<Arc<StageRegistry>> = OnceLock::new();
        Arc::clone(BUILTIN.get_or_init(|| Arc::new(Self::index(builtin_descriptors()))))
    }

    /// Builds a validated registry from descriptors.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate codes, dependencies on unknown stages,
    /// self-dependencies, company stages depending on contact stages, or a
    /// cycle in the full catalog.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = StageDescriptor>,
    ) -> Result<Self, RegistryError> {
        let descriptors: Vec<_> = descriptors.into_iter().collect();
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.code.clone()) {
                return Err(RegistryError::DuplicateStage {
                    code: descriptor.code.clone(),
                });
            }
        }

        let registry = Self::index(descriptors);
        registry.validate()?;
        Ok(registry)
    }

    fn index(descriptors: Vec<StageDescriptor>) -> Self {
        let order = descriptors.iter().map(|d| d.code.clone()).collect();
        let stages = descriptors
            .into_iter()
            .map(|d| (d.code.clone(), d))
            .collect();
        Self { stages, order }
    }

    fn validate(&self) -> Result<(), RegistryError> {
        for code in &self.order {
            let Some(stage) = self.stages.get(code) else {
                continue;
            };
            for dep in stage.hard_deps.iter().chain(&stage.soft_deps) {
                let Some(dep_stage) = self.stages.get(dep) else {
                    return Err(UnknownStageError::new(dep).referenced_by(code).into());
                };
                if dep == code {
                    return Err(RegistryError::InvalidDependency {
                        stage: code.clone(),
                        dependency: dep.clone(),
                        reason: "a stage cannot depend on itself".to_string(),
                    });
                }
                let compatible = dep_stage.entity_type == stage.entity_type
                    || stage.entity_type.parent_type() == Some(dep_stage.entity_type);
                if !compatible {
                    return Err(RegistryError::InvalidDependency {
                        stage: code.clone(),
                        dependency: dep.clone(),
                        reason: format!(
                            "{} stages cannot depend on {} stages",
                            stage.entity_type, dep_stage.entity_type
                        ),
                    });
                }
            }
        }

        self.topo_sort(&self.order, &SoftDepToggles::new())?;
        Ok(())
    }

    /// Looks up a stage.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStageError`] if the code is not registered.
    pub fn get(&self, code: &str) -> Result<&StageDescriptor, UnknownStageError> {
        self.stages
            .get(code)
            .ok_or_else(|| UnknownStageError::new(code))
    }

    /// Returns true if the code is registered.
    #[must_use]
    pub fn contains(&self, code: &str) -> bool {
        self.stages.contains_key(code)
    }

    /// Stage codes in declaration order.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the registry has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns the effective dependencies of a stage: hard dependencies, then
    /// soft dependencies if active, without duplicates.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStageError`] if the stage is not registered.
    pub fn resolve_deps(
        &self,
        stage: &str,
        soft: &SoftDepToggles,
    ) -> Result<Vec<String>, UnknownStageError> {
        let descriptor = self.get(stage)?;
        let mut deps: Vec<String> =
            Vec::with_capacity(descriptor.hard_deps.len() + descriptor.soft_deps.len());
        let soft_deps = if soft.is_active(stage) {
            descriptor.soft_deps.as_slice()
        } else {
            &[]
        };
        for dep in descriptor.hard_deps.iter().chain(soft_deps) {
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        Ok(deps)
    }

    /// Returns the stages among `selected` that `stage` waits for, in
    /// selection order: its resolved dependencies, plus every selected
    /// non-terminal stage when `stage` is terminal.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStageError`] for an unregistered code.
    pub fn selected_predecessors<S: AsRef<str>>(
        &self,
        stage: &str,
        selected: &[S],
        soft: &SoftDepToggles,
    ) -> Result<Vec<String>, UnknownStageError> {
        let descriptor = self.get(stage)?;
        let deps = self.resolve_deps(stage, soft)?;
        let mut predecessors: Vec<String> = Vec::new();
        for code in selected {
            let other = self.get(code.as_ref())?;
            if other.code == descriptor.code || predecessors.contains(&other.code) {
                continue;
            }
            if deps.contains(&other.code) || (descriptor.is_terminal && !other.is_terminal) {
                predecessors.push(other.code.clone());
            }
        }
        Ok(predecessors)
    }

    /// Orders the selected stages so every stage follows its dependencies.
    ///
    /// Kahn's algorithm with FIFO discovery: among ready stages the input
    /// order wins. Only edges between selected stages count. Terminal stages
    /// additionally follow every selected non-terminal stage.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownStage`] for an unregistered code and
    /// [`RegistryError::Cycle`] if no order exists.
    pub fn topo_sort<S: AsRef<str>>(
        &self,
        stages: &[S],
        soft: &SoftDepToggles,
    ) -> Result<Vec<String>, RegistryError> {
        let mut selected: Vec<&StageDescriptor> = Vec::with_capacity(stages.len());
        let mut position: HashMap<&str, usize> = HashMap::new();
        for code in stages {
            let descriptor = self.get(code.as_ref())?;
            if !position.contains_key(descriptor.code.as_str()) {
                position.insert(descriptor.code.as_str(), selected.len());
                selected.push(descriptor);
            }
        }

        let count = selected.len();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut in_degree = vec![0usize; count];
        let mut edges: HashSet<(usize, usize)> = HashSet::new();
        let mut add_edge = |from: usize, to: usize| {
            if edges.insert((from, to)) {
                successors[from].push(to);
                in_degree[to] += 1;
            }
        };

        for (idx, descriptor) in selected.iter().enumerate() {
            for dep in self.resolve_deps(&descriptor.code, soft)? {
                if let Some(&dep_idx) = position.get(dep.as_str()) {
                    add_edge(dep_idx, idx);
                }
            }
        }
        for (idx, descriptor) in selected.iter().enumerate() {
            if !descriptor.is_terminal {
                continue;
            }
            for (other_idx, other) in selected.iter().enumerate() {
                if other_idx != idx && !other.is_terminal {
                    add_edge(other_idx, idx);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(idx) = queue.pop_front() {
            order.push(selected[idx].code.clone());
            for &next in &successors[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < count {
            let remaining = (0..count)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| selected[i].code.clone())
                .collect();
            return Err(CycleDetectedError::new(remaining).into());
        }

        Ok(order)
    }
}

fn builtin_descriptors() -> Vec<StageDescriptor> {
    vec![
        StageDescriptor::new("l1", EntityType::Company),
        StageDescriptor::new("triage", EntityType::Company)
            .with_hard_deps(["l1"])
            .gate_stage(),
        StageDescriptor::new("l2", EntityType::Company).with_hard_deps(["triage"]),
        StageDescriptor::new("registry", EntityType::Company)
            .with_soft_deps(["l1"])
            .with_gate(CountryGate::new(["CZ", "NO"], [".cz", ".no"]).with_registration_id_rule()),
        StageDescriptor::new("person", EntityType::Contact).with_hard_deps(["l2"]),
        StageDescriptor::new("generate", EntityType::Contact)
            .with_hard_deps(["person"])
            .with_soft_deps(["registry"]),
        StageDescriptor::new("qc", EntityType::Contact)
            .with_hard_deps(["generate"])
            .terminal(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry(descriptors: Vec<StageDescriptor>) -> StageRegistry {
        StageRegistry::from_descriptors(descriptors).unwrap()
    }

    #[test]
    fn test_builtin_registry_is_valid() {
        let builtin = StageRegistry::builtin();
        let descriptors: Vec<_> = builtin
            .codes()
            .map(|c| builtin.get(c).unwrap().clone())
            .collect();

        assert!(StageRegistry::from_descriptors(descriptors).is_ok());
        assert_eq!(builtin.len(), 7);
    }

    #[test]
    fn test_resolve_deps_includes_hard_and_soft_by_default() {
        let builtin = StageRegistry::builtin();
        let soft = SoftDepToggles::new();

        for code in builtin.codes() {
            let descriptor = builtin.get(code).unwrap();
            let deps = builtin.resolve_deps(code, &soft).unwrap();
            for dep in descriptor.hard_deps.iter().chain(&descriptor.soft_deps) {
                assert!(deps.contains(dep), "{code} should depend on {dep}");
            }
        }
    }

    #[test]
    fn test_resolve_deps_drops_disabled_soft_deps() {
        let builtin = StageRegistry::builtin();
        let soft = SoftDepToggles::new().disable("generate");

        assert_eq!(builtin.resolve_deps("generate", &soft).unwrap(), vec!["person"]);
        assert_eq!(
            builtin
                .resolve_deps("generate", &SoftDepToggles::new())
                .unwrap(),
            vec!["person", "registry"]
        );
    }

    #[test]
    fn test_resolve_deps_unknown_stage() {
        let err = StageRegistry::builtin()
            .resolve_deps("nope", &SoftDepToggles::new())
            .unwrap_err();
        assert_eq!(err.code, "nope");
    }

    #[test]
    fn test_selected_predecessors() {
        let builtin = StageRegistry::builtin();
        let soft = SoftDepToggles::new();
        let selected = ["l1", "triage", "registry", "qc"];

        assert_eq!(
            builtin.selected_predecessors("triage", &selected, &soft).unwrap(),
            vec!["l1"]
        );
        assert!(builtin
            .selected_predecessors("l1", &selected, &soft)
            .unwrap()
            .is_empty());
        assert_eq!(
            builtin.selected_predecessors("qc", &selected, &soft).unwrap(),
            vec!["l1", "triage", "registry"]
        );
        assert!(builtin
            .selected_predecessors("registry", &selected, &soft.clone().disable("registry"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_topo_sort_chain() {
        let order = StageRegistry::builtin()
            .topo_sort(&["l1", "triage", "l2"], &SoftDepToggles::new())
            .unwrap();
        assert_eq!(order, vec!["l1", "triage", "l2"]);
    }

    #[test]
    fn test_topo_sort_reorders_input() {
        let order = StageRegistry::builtin()
            .topo_sort(&["l2", "l1", "triage"], &SoftDepToggles::new())
            .unwrap();
        assert_eq!(order, vec!["l1", "triage", "l2"]);
    }

    #[test]
    fn test_topo_sort_terminal_stage_runs_last() {
        let reg = registry(vec![
            StageDescriptor::new("qc", EntityType::Company).terminal(),
            StageDescriptor::new("a", EntityType::Company),
            StageDescriptor::new("b", EntityType::Company),
        ]);

        let order = reg.topo_sort(&["qc", "a", "b"], &SoftDepToggles::new()).unwrap();
        assert_eq!(order, vec!["a", "b", "qc"]);
    }

    #[test]
    fn test_topo_sort_is_deterministic_for_independent_stages() {
        let reg = registry(vec![
            StageDescriptor::new("a", EntityType::Company),
            StageDescriptor::new("b", EntityType::Company),
            StageDescriptor::new("c", EntityType::Company),
        ]);

        let first = reg.topo_sort(&["c", "a", "b"], &SoftDepToggles::new()).unwrap();
        let second = reg.topo_sort(&["c", "a", "b"], &SoftDepToggles::new()).unwrap();
        assert_eq!(first, vec!["c", "a", "b"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_topo_sort_ignores_unselected_dependencies() {
        let order = StageRegistry::builtin()
            .topo_sort(&["l2", "person"], &SoftDepToggles::new())
            .unwrap();
        assert_eq!(order, vec!["l2", "person"]);
    }

    #[test]
    fn test_topo_sort_unknown_stage() {
        let err = StageRegistry::builtin()
            .topo_sort(&["l1", "l9"], &SoftDepToggles::new())
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownStage(ref e) if e.code == "l9"));
    }

    #[test]
    fn test_topo_sort_cycle_through_terminal_stage() {
        let reg = StageRegistry::index(vec![
            StageDescriptor::new("qc", EntityType::Company).terminal(),
            StageDescriptor::new("after", EntityType::Company).with_hard_deps(["qc"]),
        ]);

        let err = reg.topo_sort(&["qc", "after"], &SoftDepToggles::new()).unwrap_err();
        let RegistryError::Cycle(cycle) = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(cycle.stages, vec!["qc", "after"]);
    }

    #[test]
    fn test_soft_cycle_only_when_active() {
        let reg = StageRegistry::index(vec![
            StageDescriptor::new("a", EntityType::Company).with_soft_deps(["b"]),
            StageDescriptor::new("b", EntityType::Company).with_hard_deps(["a"]),
        ]);

        assert!(reg.topo_sort(&["a", "b"], &SoftDepToggles::new()).is_err());
        let order = reg
            .topo_sort(&["a", "b"], &SoftDepToggles::new().disable("a"))
            .unwrap();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_from_descriptors_rejects_bad_catalogs() {
        let duplicate = StageRegistry::from_descriptors(vec![
            StageDescriptor::new("a", EntityType::Company),
            StageDescriptor::new("a", EntityType::Company),
        ]);
        assert!(matches!(duplicate, Err(RegistryError::DuplicateStage { .. })));

        let unknown = StageRegistry::from_descriptors(vec![
            StageDescriptor::new("a", EntityType::Company).with_hard_deps(["ghost"]),
        ]);
        assert!(matches!(
            unknown,
            Err(RegistryError::UnknownStage(ref e)) if e.referenced_by.as_deref() == Some("a")
        ));

        let wrong_direction = StageRegistry::from_descriptors(vec![
            StageDescriptor::new("person", EntityType::Contact),
            StageDescriptor::new("l1", EntityType::Company).with_hard_deps(["person"]),
        ]);
        assert!(matches!(wrong_direction, Err(RegistryError::InvalidDependency { .. })));

        let self_dep = StageRegistry::from_descriptors(vec![
            StageDescriptor::new("a", EntityType::Company).with_hard_deps(["a"]),
        ]);
        assert!(matches!(self_dep, Err(RegistryError::InvalidDependency { .. })));
    }
}
