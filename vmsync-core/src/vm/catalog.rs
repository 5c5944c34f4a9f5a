//! Type Catalog
//!
//! Maps the type names clients ask for to the factories that build them.
//! Each registration also carries the access policy the authorize filter
//! enforces for that type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use super::ViewModel;
use crate::error::{BoxError, InstantiationError};
use crate::filter::Principal;
use crate::ids::InstanceId;

/// Everything a factory may use to build an instance.
///
/// `principal` and `attributes` carry whatever the inbound filters attached
/// to the exchange, such as the authenticated user or a raw access token.
#[derive(Debug, Clone, Copy)]
pub struct VmArgs<'a> {
    pub instance: &'a InstanceId,
    pub type_name: &'a str,
    pub principal: Option<&'a Principal>,
    pub attributes: &'a HashMap<String, Value>,
}

/// Builds a fresh instance of one view-model type.
pub type Factory = Arc<dyn Fn(&VmArgs<'_>) -> Result<Box<dyn ViewModel>, BoxError> + Send + Sync>;

/// Who may talk to instances of a type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    #[default]
    Anonymous,
    /// Any authenticated principal.
    Authenticated,
    /// An authenticated principal holding at least one of the roles.
    Roles(Vec<String>),
}

impl AccessPolicy {
    /// Check whether `principal` satisfies the policy.
    pub fn permits(&self, principal: Option<&Principal>) -> bool {
        match (self, principal) {
            (Self::Anonymous, _) => true,
            (Self::Authenticated, Some(_)) => true,
            (Self::Roles(roles), Some(principal)) => roles.iter().any(|role| principal.has_role(role)),
            (_, None) => false,
        }
    }
}

/// One catalog entry.
#[derive(Clone)]
pub struct Registration {
    pub policy: AccessPolicy,
    factory: Factory,
}

impl Registration {
    /// Run the factory.
    pub fn create(&self, args: &VmArgs<'_>) -> Result<Box<dyn ViewModel>, BoxError> {
        (self.factory)(args)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Immutable catalog of view-model types.
#[derive(Debug, Clone, Default)]
pub struct TypeCatalog {
    types: IndexMap<String, Registration>,
}

impl TypeCatalog {
    pub fn builder() -> TypeCatalogBuilder {
        TypeCatalogBuilder::default()
    }

    pub fn get(&self, type_name: &str) -> Option<&Registration> {
        self.types.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Access policy of a type. Unknown types are treated as anonymous so
    /// that the unknown-type error, not a rejection, reaches the client.
    pub fn policy(&self, type_name: &str) -> AccessPolicy {
        self.types
            .get(type_name)
            .map(|registration| registration.policy.clone())
            .unwrap_or_default()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Build a new instance of `args.type_name`.
    pub fn instantiate(&self, args: &VmArgs<'_>) -> Result<Box<dyn ViewModel>, InstantiationError> {
        let registration = self
            .get(args.type_name)
            .ok_or_else(|| InstantiationError::UnknownType(args.type_name.to_owned()))?;

        registration
            .create(args)
            .map_err(|source| InstantiationError::Factory {
                type_name: args.type_name.to_owned(),
                source,
            })
    }
}

/// Builder for [`TypeCatalog`].
#[derive(Default)]
pub struct TypeCatalogBuilder {
    types: IndexMap<String, Registration>,
}

impl TypeCatalogBuilder {
    /// Register an anonymous-access type.
    pub fn register<F>(self, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&VmArgs<'_>) -> Result<Box<dyn ViewModel>, BoxError> + Send + Sync + 'static,
    {
        self.register_with_policy(type_name, AccessPolicy::Anonymous, factory)
    }

    /// Register a type guarded by `policy`.
    pub fn register_with_policy<F>(
        mut self,
        type_name: impl Into<String>,
        policy: AccessPolicy,
        factory: F,
    ) -> Self
    where
        F: Fn(&VmArgs<'_>) -> Result<Box<dyn ViewModel>, BoxError> + Send + Sync + 'static,
    {
        self.types.insert(
            type_name.into(),
            Registration {
                policy,
                factory: Arc::new(factory),
            },
        );
        self
    }

    pub fn build(self) -> TypeCatalog {
        TypeCatalog { types: self.types }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PropertyError;
    use crate::state::PropertyDescriptor;

    struct Empty;

    impl ViewModel for Empty {
        fn properties(&self) -> &[PropertyDescriptor] {
            &[]
        }

        fn get_property(&self, _name: &str) -> Option<Value> {
            None
        }

        fn set_property(&mut self, name: &str, _value: Value) -> Result<(), PropertyError> {
            Err(PropertyError::Unknown(name.to_owned()))
        }
    }

    fn args<'a>(
        instance: &'a InstanceId,
        type_name: &'a str,
        attributes: &'a HashMap<String, Value>,
    ) -> VmArgs<'a> {
        VmArgs {
            instance,
            type_name,
            principal: None,
            attributes,
        }
    }

    #[test]
    fn instantiates_registered_types() {
        let catalog = TypeCatalog::builder()
            .register("Empty", |_| Ok(Box::new(Empty)))
            .build();

        let id = InstanceId::new("Empty");
        let attributes = HashMap::new();
        assert!(catalog.instantiate(&args(&id, "Empty", &attributes)).is_ok());
        assert_eq!(catalog.type_names().collect::<Vec<_>>(), ["Empty"]);
    }

    #[test]
    fn unknown_type_is_an_instantiation_error() {
        let catalog = TypeCatalog::builder().build();
        let id = InstanceId::new("Nope");
        let attributes = HashMap::new();

        let err = catalog.instantiate(&args(&id, "Nope", &attributes)).err().unwrap();
        assert!(matches!(err, InstantiationError::UnknownType(name) if name == "Nope"));
    }

    #[test]
    fn factory_errors_are_wrapped() {
        let catalog = TypeCatalog::builder()
            .register("Broken", |_| Err("database is down".into()))
            .build();
        let id = InstanceId::new("Broken");
        let attributes = HashMap::new();

        let err = catalog.instantiate(&args(&id, "Broken", &attributes)).err().unwrap();
        assert_eq!(err.to_string(), "factory for `Broken` failed: database is down");
    }

    #[test]
    fn policies_check_principals() {
        let admin = Principal::new("ada").with_role("admin");
        let guest = Principal::new("bob");

        assert!(AccessPolicy::Anonymous.permits(None));
        assert!(!AccessPolicy::Authenticated.permits(None));
        assert!(AccessPolicy::Authenticated.permits(Some(&guest)));

        let admins = AccessPolicy::Roles(vec!["admin".into()]);
        assert!(admins.permits(Some(&admin)));
        assert!(!admins.permits(Some(&guest)));
        assert!(!admins.permits(None));
    }
}
