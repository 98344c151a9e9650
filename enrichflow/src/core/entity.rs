//! Business entities read by the eligibility engine.

use serde::{Deserialize, Serialize};

use super::EntityType;

/// A company or contact as seen by the scheduler.
///
/// Entities are owned by the caller layer (imports, CRM sync). The scheduler
/// only reads the fields that drive eligibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique entity id.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Scope within the tenant (e.g., an import batch or tag).
    pub scope_id: String,
    /// Company or contact.
    pub entity_type: EntityType,
    /// Display name, used for stable ordering.
    pub name: String,
    /// Owning company for contacts.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Assigned owner (sales rep).
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Account tier, only meaningful for companies.
    #[serde(default)]
    pub tier: Option<String>,
    /// ISO-3166 alpha-2 country code, upper-case.
    #[serde(default)]
    pub country: Option<String>,
    /// Normalized domain (see [`normalize_domain`]).
    #[serde(default)]
    pub domain: Option<String>,
    /// National business registration number.
    #[serde(default)]
    pub registration_id: Option<String>,
}

impl Entity {
    /// Creates a company.
    #[must_use]
    pub fn company(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        scope_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::new(EntityType::Company, id, tenant_id, scope_id, name)
    }

    /// Creates a contact owned by `company_id`.
    #[must_use]
    pub fn contact(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        scope_id: impl Into<String>,
        name: impl Into<String>,
        company_id: impl Into<String>,
    ) -> Self {
        let mut entity = Self::new(EntityType::Contact, id, tenant_id, scope_id, name);
        entity.parent_id = Some(company_id.into());
        entity
    }

    fn new(
        entity_type: EntityType,
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        scope_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            scope_id: scope_id.into(),
            entity_type,
            name: name.into(),
            parent_id: None,
            owner_id: None,
            tier: None,
            country: None,
            domain: None,
            registration_id: None,
        }
    }

    /// Sets the owner.
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Sets the tier.
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Sets the country, upper-cased.
    #[must_use]
    pub fn with_country(mut self, country: impl AsRef<str>) -> Self {
        let country = country.as_ref().trim().to_ascii_uppercase();
        self.country = (!country.is_empty()).then_some(country);
        self
    }

    /// Sets the domain, normalized.
    #[must_use]
    pub fn with_domain(mut self, domain: impl AsRef<str>) -> Self {
        self.domain = normalize_domain(domain.as_ref());
        self
    }

    /// Sets the registration id.
    #[must_use]
    pub fn with_registration_id(mut self, registration_id: impl Into<String>) -> Self {
        let registration_id = registration_id.into();
        self.registration_id = (!registration_id.trim().is_empty()).then_some(registration_id);
        self
    }

    /// Returns true if the entity carries a non-blank registration id.
    #[must_use]
    pub fn has_registration_id(&self) -> bool {
        self.registration_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty())
    }
}

/// Reduces a website or e-mail domain to a lower-case host.
///
/// Strips the scheme, credentials, a leading `www.`, port, path, query and a
/// trailing dot. Returns `None` for blank input.
#[must_use]
pub fn normalize_domain(raw: &str) -> Option<String> {
    let mut host = raw.trim().to_ascii_lowercase();
    if let Some(idx) = host.find("://") {
        host = host[idx + 3..].to_string();
    }
    if let Some(idx) = host.rfind('@') {
        host = host[idx + 1..].to_string();
    }
    if let Some(idx) = host.find(|c: char| matches!(c, '/' | '?' | '#')) {
        host.truncate(idx);
    }
    if let Some(idx) = host.find(':') {
        host.truncate(idx);
    }
    let host = host.trim_end_matches('.');
    let host = host.strip_prefix("www.").unwrap_or(host);
    (!host.is_empty()).then(|| host.to_string())
}
