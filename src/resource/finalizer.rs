//! Finalizers are persisted as string tokens, but each one has exactly one owner that is
//! allowed to release it:
//!
//! - `ServiceCatalog` is attached to instances and bindings at admission. The instance or
//!   binding reconciler releases it once the broker-side resource is known to be gone
//!   (deprovision/unbind succeeded or was never required).
//! - `CatalogOwner` is attached to brokers by the broker reconciler on first observation and
//!   released once every class and plan owned by the broker has been deleted.
use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Finalizer {
    ServiceCatalog,
    CatalogOwner,
}

impl Finalizer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Finalizer::ServiceCatalog => "kubernetes-incubator/service-catalog",
            Finalizer::CatalogOwner => "servicecatalog.k8s.io/catalog-owner",
        }
    }

    pub fn parse(value: &str) -> Option<Finalizer> {
        match value {
            "kubernetes-incubator/service-catalog" => Some(Finalizer::ServiceCatalog),
            "servicecatalog.k8s.io/catalog-owner" => Some(Finalizer::CatalogOwner),
            _ => None,
        }
    }
}

impl Display for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
