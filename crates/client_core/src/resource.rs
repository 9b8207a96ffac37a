use std::fmt;

/// Cached resource families. Every key of a family starts with its prefix, so
/// a family can be invalidated with a single prefix delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceFamily {
    CompanyProfile,
    CompanyTeam,
    CompanyStats,
    CustomerProfile,
    CustomerCompanies,
    DealBoard,
    DealStats,
}

impl ResourceFamily {
    pub const COMPANY: [ResourceFamily; 3] = [
        ResourceFamily::CompanyProfile,
        ResourceFamily::CompanyTeam,
        ResourceFamily::CompanyStats,
    ];

    /// Families holding aggregates derived from deal placement.
    pub const DEAL_AGGREGATES: [ResourceFamily; 2] =
        [ResourceFamily::DealBoard, ResourceFamily::DealStats];

    pub fn prefix(self) -> &'static str {
        match self {
            Self::CompanyProfile => "company_profile",
            Self::CompanyTeam => "company_team",
            Self::CompanyStats => "company_stats",
            Self::CustomerProfile => "customer_profile",
            Self::CustomerCompanies => "customer_companies",
            Self::DealBoard => "deal_board",
            Self::DealStats => "deal_stats",
        }
    }
}

/// Identifies one readable resource: its family, an optional scope (such as a
/// pipeline id) and optional filter parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    family: ResourceFamily,
    scope: Option<String>,
    filters: Vec<(String, String)>,
}

impl ResourceKey {
    pub fn new(family: ResourceFamily) -> Self {
        Self {
            family,
            scope: None,
            filters: Vec::new(),
        }
    }

    pub fn scoped(family: ResourceFamily, scope: impl ToString) -> Self {
        Self {
            family,
            scope: Some(scope.to_string()),
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((name.into(), value.into()));
        self
    }

    pub fn family(&self) -> ResourceFamily {
        self.family
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn filters(&self) -> &[(String, String)] {
        &self.filters
    }

    /// Storage key for this resource, or `None` when filters are present.
    /// Filtered queries are never cached.
    pub fn cache_key(&self) -> Option<String> {
        if !self.filters.is_empty() {
            return None;
        }
        Some(match &self.scope {
            Some(scope) => format!("{}_cache:{scope}", self.family.prefix()),
            None => format!("{}_cache", self.family.prefix()),
        })
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_cache", self.family.prefix())?;
        if let Some(scope) = &self.scope {
            write!(f, ":{scope}")?;
        }
        for (index, (name, value)) in self.filters.iter().enumerate() {
            let sep = if index == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}
