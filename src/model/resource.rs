use crate::error::LakeguardError;
use compact_str::CompactString;
use std::fmt;
use std::str::FromStr;

pub const MAX_RESOURCE_LEVELS: usize = 4;

/// Depth of a name within the catalog hierarchy. Ordering follows depth, so
/// `Column > Table > Schema > Catalog` and a deeper level is always the more
/// specific one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceLevel {
    Catalog,
    Schema,
    Table,
    Column,
}

impl ResourceLevel {
    fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            1 => Some(ResourceLevel::Catalog),
            2 => Some(ResourceLevel::Schema),
            3 => Some(ResourceLevel::Table),
            4 => Some(ResourceLevel::Column),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceLevel::Catalog => "catalog",
            ResourceLevel::Schema => "schema",
            ResourceLevel::Table => "table",
            ResourceLevel::Column => "column",
        }
    }
}

impl fmt::Display for ResourceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A hierarchical `catalog.schema.table.column` name.
///
/// Levels are contiguous from the catalog down: a column name always carries
/// its table, schema and catalog. Containment is purely structural: a schema
/// contains its tables and everything beneath them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    segments: Vec<CompactString>,
}

impl Resource {
    pub fn catalog(catalog: impl Into<CompactString>) -> Self {
        Self {
            segments: vec![catalog.into()],
        }
    }

    pub fn schema(catalog: impl Into<CompactString>, schema: impl Into<CompactString>) -> Self {
        Self {
            segments: vec![catalog.into(), schema.into()],
        }
    }

    pub fn table(
        catalog: impl Into<CompactString>,
        schema: impl Into<CompactString>,
        table: impl Into<CompactString>,
    ) -> Self {
        Self {
            segments: vec![catalog.into(), schema.into(), table.into()],
        }
    }

    pub fn column(
        catalog: impl Into<CompactString>,
        schema: impl Into<CompactString>,
        table: impl Into<CompactString>,
        column: impl Into<CompactString>,
    ) -> Self {
        Self {
            segments: vec![catalog.into(), schema.into(), table.into(), column.into()],
        }
    }

    pub fn level(&self) -> ResourceLevel {
        // Constructors and FromStr both cap the depth, so this cannot fail.
        ResourceLevel::from_depth(self.segments.len()).unwrap_or(ResourceLevel::Column)
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.as_str())
    }

    pub fn segment(&self, level: ResourceLevel) -> Option<&str> {
        self.segments.get(level as usize).map(|s| s.as_str())
    }

    /// The name one level up, or `None` for a catalog.
    pub fn parent(&self) -> Option<Resource> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Resource {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// The owning table of a column resource; any other level is returned
    /// unchanged. Object storage has no column granularity, so location
    /// resolution always happens at this name.
    pub fn table_scope(&self) -> Resource {
        if self.segments.len() > 3 {
            Resource {
                segments: self.segments[..3].to_vec(),
            }
        } else {
            self.clone()
        }
    }

    /// Structural containment: true when `other` is this resource or sits
    /// anywhere beneath it in the hierarchy.
    pub fn contains(&self, other: &Resource) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments == other.segments[..self.segments.len()]
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, segment) in self.segments.iter().enumerate() {
            if idx > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl FromStr for Resource {
    type Err = LakeguardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = parse_dotted(s)?;
        Ok(Resource { segments })
    }
}

/// A grant's resource pattern: an exact dotted name, or a name with `*` as
/// the final segment.
///
/// A wildcard covers everything strictly beneath its base and ranks one
/// level deeper than the base: `cat.sales.*` competes at table specificity,
/// behind exact table names but ahead of schema-level grants. An exact
/// pattern covers its own resource and the subtree beneath it, ranking at
/// its own level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePattern {
    base: Vec<CompactString>,
    wildcard: bool,
}

impl ResourcePattern {
    pub fn exact(resource: &Resource) -> Self {
        Self {
            base: resource.segments.clone(),
            wildcard: false,
        }
    }

    /// All children of `base`, e.g. every table of a schema.
    pub fn children_of(base: &Resource) -> Result<Self, LakeguardError> {
        if base.segments.len() >= MAX_RESOURCE_LEVELS {
            return Err(LakeguardError::MalformedGrant {
                pattern: format!("{base}.*"),
                reason: "columns have no children to wildcard over".to_string(),
            });
        }
        Ok(Self {
            base: base.segments.clone(),
            wildcard: true,
        })
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// The specificity tier this pattern competes at. For a wildcard that is
    /// one level below the base: the level of the names it stands in for.
    pub fn tier(&self) -> ResourceLevel {
        let depth = if self.wildcard {
            self.base.len() + 1
        } else {
            self.base.len()
        };
        ResourceLevel::from_depth(depth).unwrap_or(ResourceLevel::Column)
    }

    /// Number of exact leading segments; the index uses this to place the
    /// pattern in its tree.
    pub fn base_depth(&self) -> usize {
        self.base.len()
    }

    pub fn base_segments(&self) -> impl Iterator<Item = &str> {
        self.base.iter().map(|s| s.as_str())
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if resource.segments.len() < self.base.len() {
            return false;
        }
        if self.base[..] != resource.segments[..self.base.len()] {
            return false;
        }
        if self.wildcard {
            // `base.*` never covers the base itself, only names beneath it.
            resource.segments.len() > self.base.len()
        } else {
            true
        }
    }
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, segment) in self.base.iter().enumerate() {
            if idx > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment)?;
        }
        if self.wildcard {
            if !self.base.is_empty() {
                f.write_str(".")?;
            }
            f.write_str("*")?;
        }
        Ok(())
    }
}

impl FromStr for ResourcePattern {
    type Err = LakeguardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut raw: Vec<&str> = s.split('.').collect();
        let wildcard = raw.last().is_some_and(|last| *last == "*");
        if wildcard {
            raw.pop();
        }
        if wildcard && raw.len() >= MAX_RESOURCE_LEVELS {
            return Err(LakeguardError::MalformedGrant {
                pattern: s.to_string(),
                reason: format!("more than {MAX_RESOURCE_LEVELS} levels"),
            });
        }
        if !wildcard && raw.is_empty() {
            return Err(LakeguardError::MalformedGrant {
                pattern: s.to_string(),
                reason: "empty pattern".to_string(),
            });
        }
        if !wildcard && raw.len() > MAX_RESOURCE_LEVELS {
            return Err(LakeguardError::MalformedGrant {
                pattern: s.to_string(),
                reason: format!("more than {MAX_RESOURCE_LEVELS} levels"),
            });
        }
        let mut base = Vec::with_capacity(raw.len());
        for segment in raw {
            if segment.is_empty() {
                return Err(LakeguardError::MalformedGrant {
                    pattern: s.to_string(),
                    reason: "empty segment".to_string(),
                });
            }
            if segment.contains('*') {
                return Err(LakeguardError::MalformedGrant {
                    pattern: s.to_string(),
                    reason: "wildcard only permitted as the final segment".to_string(),
                });
            }
            base.push(CompactString::from(segment));
        }
        Ok(ResourcePattern { base, wildcard })
    }
}

impl TryFrom<String> for ResourcePattern {
    type Error = LakeguardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourcePattern> for String {
    fn from(value: ResourcePattern) -> Self {
        value.to_string()
    }
}

fn parse_dotted(s: &str) -> Result<Vec<CompactString>, LakeguardError> {
    let raw: Vec<&str> = s.split('.').collect();
    if raw.len() > MAX_RESOURCE_LEVELS {
        return Err(LakeguardError::InvalidResource {
            name: s.to_string(),
            reason: format!("expected 1 to {MAX_RESOURCE_LEVELS} dot-separated levels"),
        });
    }
    let mut segments = Vec::with_capacity(raw.len());
    for segment in raw {
        if segment.is_empty() {
            return Err(LakeguardError::InvalidResource {
                name: s.to_string(),
                reason: "empty segment".to_string(),
            });
        }
        if segment.contains('*') {
            return Err(LakeguardError::InvalidResource {
                name: s.to_string(),
                reason: "resource names cannot contain '*'".to_string(),
            });
        }
        segments.push(CompactString::from(segment));
    }
    Ok(segments)
}
