use crate::error::LakeguardError;
use crate::model::{Privilege, Resource};
use crate::scope::{ScopeAction, StoragePrefix, StorageScope};
use async_trait::async_trait;
use std::collections::HashMap;

/// Maps a table (or a schema owning a warehouse directory) to the storage
/// locations its data lives under; a table may span several, as with
/// external partitions parked outside the table directory. Typically backed
/// by a metastore; a resolution failure fails the credential request rather
/// than widening it.
#[async_trait]
pub trait LocationResolver: Send + Sync {
    async fn locate(&self, resource: &Resource) -> Result<Vec<StoragePrefix>, LakeguardError>;
}

/// Fixed name-to-location mapping. Registering a resource again adds a
/// further location rather than replacing the first. A resource without its
/// own entry inherits from the nearest registered ancestor, with the
/// remaining name segments appended as path components under each of the
/// ancestor's locations, which is how warehouse layouts place tables under
/// their schema directory.
#[derive(Debug, Clone, Default)]
pub struct StaticLocationResolver {
    locations: HashMap<Resource, Vec<StoragePrefix>>,
}

impl StaticLocationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(
        mut self,
        resource: Resource,
        location: &str,
    ) -> Result<Self, LakeguardError> {
        let prefix =
            StoragePrefix::parse(location).map_err(|reason| LakeguardError::ScopeResolution {
                resource: resource.to_string(),
                reason,
            })?;
        self.locations.entry(resource).or_default().push(prefix);
        Ok(self)
    }
}

#[async_trait]
impl LocationResolver for StaticLocationResolver {
    async fn locate(&self, resource: &Resource) -> Result<Vec<StoragePrefix>, LakeguardError> {
        if let Some(found) = self.locations.get(resource) {
            return Ok(found.clone());
        }
        let mut ancestor = resource.parent();
        while let Some(current) = ancestor {
            if let Some(bases) = self.locations.get(&current) {
                let depth = current.segments().count();
                let suffix: Vec<&str> = resource.segments().skip(depth).collect();
                let mut derived = Vec::with_capacity(bases.len());
                for base in bases {
                    let raw = format!("{}{}", base.as_str(), suffix.join("/"));
                    derived.push(StoragePrefix::parse(&raw).map_err(|reason| {
                        LakeguardError::ScopeResolution {
                            resource: resource.to_string(),
                            reason,
                        }
                    })?);
                }
                return Ok(derived);
            }
            ancestor = current.parent();
        }
        Err(LakeguardError::ScopeResolution {
            resource: resource.to_string(),
            reason: "no storage location registered".to_string(),
        })
    }
}

/// Folds a batch of granted accesses into the minimal scope that serves
/// them. Column accesses resolve at their owning table, privileges without
/// a storage action contribute nothing, and a batch that yields no prefix
/// at all is refused instead of producing an unscoped credential.
pub async fn resolve_scope(
    resolver: &dyn LocationResolver,
    accesses: &[(Resource, Privilege)],
) -> Result<StorageScope, LakeguardError> {
    let mut scope = StorageScope::default();
    for (resource, privilege) in accesses {
        let Some(action) = ScopeAction::for_privilege(*privilege) else {
            continue;
        };
        let prefixes = resolver.locate(&resource.table_scope()).await?;
        if prefixes.is_empty() {
            return Err(LakeguardError::ScopeResolution {
                resource: resource.to_string(),
                reason: "resolver returned no locations".to_string(),
            });
        }
        for prefix in prefixes {
            scope.insert(action, prefix);
        }
    }
    if scope.is_empty() {
        return Err(LakeguardError::EmptyScope);
    }
    Ok(scope)
}
