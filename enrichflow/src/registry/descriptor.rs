//! Stage descriptors, country gates and soft dependency toggles.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::{EntityType, Entity};

/// Static description of one stage in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Unique stage code.
    pub code: String,
    /// Entity type the stage processes.
    pub entity_type: EntityType,
    /// Stages that must have completed for an entity first.
    #[serde(default)]
    pub hard_deps: Vec<String>,
    /// Stages honoured only when soft dependencies are active for the run.
    #[serde(default)]
    pub soft_deps: Vec<String>,
    /// Restricts which entities the stage ever applies to.
    #[serde(default)]
    pub gate: Option<CountryGate>,
    /// The stage reclassifies entities instead of only producing data.
    #[serde(default)]
    pub is_gate: bool,
    /// The stage runs after every other selected stage.
    #[serde(default)]
    pub is_terminal: bool,
}

impl StageDescriptor {
    /// Creates a descriptor without dependencies.
    #[must_use]
    pub fn new(code: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            code: code.into(),
            entity_type,
            hard_deps: Vec::new(),
            soft_deps: Vec::new(),
            gate: None,
            is_gate: false,
            is_terminal: false,
        }
    }

    /// Adds hard dependencies.
    #[must_use]
    pub fn with_hard_deps(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.hard_deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Adds soft dependencies.
    #[must_use]
    pub fn with_soft_deps(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.soft_deps.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Sets the country/registration gate.
    #[must_use]
    pub fn with_gate(mut self, gate: CountryGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Marks the stage as a gate stage.
    #[must_use]
    pub fn gate_stage(mut self) -> Self {
        self.is_gate = true;
        self
    }

    /// Marks the stage as terminal.
    #[must_use]
    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }
}

/// Country, TLD and registration-id allow rules for a stage.
///
/// An entity passes when any rule matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryGate {
    /// Upper-case ISO-2 country codes.
    #[serde(default)]
    pub countries: Vec<String>,
    /// Lower-case TLDs including the leading dot (e.g. ".cz").
    #[serde(default)]
    pub tlds: Vec<String>,
    /// Entities carrying a registration id pass.
    #[serde(default)]
    pub match_registration_id: bool,
}

impl CountryGate {
    /// Creates a gate from countries and TLDs, normalizing their case.
    #[must_use]
    pub fn new(
        countries: impl IntoIterator<Item = impl AsRef<str>>,
        tlds: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        Self {
            countries: countries
                .into_iter()
                .map(|c| c.as_ref().trim().to_ascii_uppercase())
                .collect(),
            tlds: tlds
                .into_iter()
                .map(|t| {
                    let t = t.as_ref().trim().to_ascii_lowercase();
                    if t.starts_with('.') { t } else { format!(".{t}") }
                })
                .collect(),
            match_registration_id: false,
        }
    }

    /// Lets entities with a registration id pass.
    #[must_use]
    pub fn with_registration_id_rule(mut self) -> Self {
        self.match_registration_id = true;
        self
    }

    /// Returns true if the subject entity passes the gate.
    ///
    /// A missing subject (a contact without company) never passes.
    #[must_use]
    pub fn matches(&self, subject: Option<&Entity>) -> bool {
        let Some(subject) = subject else {
            return false;
        };
        let country_match = subject
            .country
            .as_deref()
            .is_some_and(|c| self.countries.iter().any(|allowed| allowed.eq_ignore_ascii_case(c)));
        let tld_match = subject.domain.as_deref().is_some_and(|domain| {
            let domain = domain.to_ascii_lowercase();
            self.tlds.iter().any(|tld| domain.ends_with(tld.as_str()))
        });
        let registration_match = self.match_registration_id && subject.has_registration_id();

        country_match || tld_match || registration_match
    }
}

/// Per-run activation of soft dependencies, keyed by dependent stage.
///
/// Soft dependencies are active unless explicitly disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SoftDepToggles {
    overrides: HashMap<String, bool>,
}

impl SoftDepToggles {
    /// Creates toggles with every soft dependency active.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Disables soft dependencies for `stage`.
    #[must_use]
    pub fn disable(mut self, stage: impl Into<String>) -> Self {
        self.overrides.insert(stage.into(), false);
        self
    }

    /// Explicitly enables soft dependencies for `stage`.
    #[must_use]
    pub fn enable(mut self, stage: impl Into<String>) -> Self {
        self.overrides.insert(stage.into(), true);
        self
    }

    /// Returns true if soft dependencies of `stage` are active.
    #[must_use]
    pub fn is_active(&self, stage: &str) -> bool {
        self.overrides.get(stage).copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(country: Option<&str>, domain: Option<&str>) -> Entity {
        let mut entity = Entity::company("c1", "t1", "s1", "Acme");
        if let Some(country) = country {
            entity = entity.with_country(country);
        }
        if let Some(domain) = domain {
            entity = entity.with_domain(domain);
        }
        entity
    }

    #[test]
    fn test_gate_normalizes_rules() {
        let gate = CountryGate::new(["cz", " no "], ["CZ", ".no"]);
        assert_eq!(gate.countries, vec!["CZ", "NO"]);
        assert_eq!(gate.tlds, vec![".cz", ".no"]);
    }

    #[test]
    fn test_gate_matches_country_or_tld() {
        let gate = CountryGate::new(["CZ", "NO"], [".cz", ".no"]);

        assert!(gate.matches(Some(&company(Some("CZ"), None))));
        assert!(gate.matches(Some(&company(Some("DE"), Some("firma.cz")))));
        assert!(!gate.matches(Some(&company(Some("US"), Some("acme.com")))));
        assert!(!gate.matches(None));
    }

    #[test]
    fn test_gate_registration_rule() {
        let gate = CountryGate::new(["CZ"], Vec::<String>::new()).with_registration_id_rule();
        let registered = company(Some("US"), Some("acme.com")).with_registration_id("12345678");

        assert!(gate.matches(Some(&registered)));
        assert!(!gate.matches(Some(&company(Some("US"), None))));
    }

    #[test]
    fn test_soft_dep_toggles_default_active() {
        let toggles = SoftDepToggles::new().disable("generate");
        assert!(toggles.is_active("registry"));
        assert!(!toggles.is_active("generate"));
        assert!(toggles.enable("generate").is_active("generate"));
    }
}
