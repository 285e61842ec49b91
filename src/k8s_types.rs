use std::fmt::{self, Display};
use std::hash::{self, Hash};

use crate::resource::ObjectIdRef;

pub const SERVICE_CATALOG_GROUP: &str = "servicecatalog.k8s.io";

/// A basic description of a resource kind, with just enough information for the store to key
/// objects and for the runner to label metrics. All fields are `&'static str` so references can
/// be passed around freely without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sType {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
    pub namespaced: bool,
}

impl Hash for K8sType {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.api_version.hash(hasher);
        self.kind.hash(hasher);
    }
}

impl K8sType {
    pub fn as_group_and_version(&self) -> (&str, &str) {
        match self.api_version.find('/') {
            Some(slash_idx) => (
                &self.api_version[..slash_idx],
                &self.api_version[(slash_idx + 1)..],
            ),
            None => ("", self.api_version),
        }
    }

    pub fn group(&self) -> &str {
        self.as_group_and_version().0
    }

    pub fn version(&self) -> &str {
        self.as_group_and_version().1
    }

    /// Returns the persisted key for an object of this kind, in the
    /// `/<group>/<plural>/[<namespace>/]<name>` layout.
    pub fn storage_key(&self, id: &ObjectIdRef<'_>) -> String {
        let mut key = String::with_capacity(64);
        if !self.group().is_empty() {
            key.push('/');
            key.push_str(self.group());
        }
        key.push('/');
        key.push_str(self.plural_kind);
        if let Some(ns) = id.namespace() {
            key.push('/');
            key.push_str(ns);
        }
        key.push('/');
        key.push_str(id.name());
        key
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

pub mod v1beta1 {
    use super::K8sType;

    pub static ClusterServiceBroker: &K8sType = &K8sType {
        api_version: "servicecatalog.k8s.io/v1beta1",
        kind: "ClusterServiceBroker",
        plural_kind: "clusterservicebrokers",
        namespaced: false,
    };

    pub static ServiceBroker: &K8sType = &K8sType {
        api_version: "servicecatalog.k8s.io/v1beta1",
        kind: "ServiceBroker",
        plural_kind: "servicebrokers",
        namespaced: true,
    };

    pub static ClusterServiceClass: &K8sType = &K8sType {
        api_version: "servicecatalog.k8s.io/v1beta1",
        kind: "ClusterServiceClass",
        plural_kind: "clusterserviceclasses",
        namespaced: false,
    };

    pub static ServiceClass: &K8sType = &K8sType {
        api_version: "servicecatalog.k8s.io/v1beta1",
        kind: "ServiceClass",
        plural_kind: "serviceclasses",
        namespaced: true,
    };

    pub static ClusterServicePlan: &K8sType = &K8sType {
        api_version: "servicecatalog.k8s.io/v1beta1",
        kind: "ClusterServicePlan",
        plural_kind: "clusterserviceplans",
        namespaced: false,
    };

    pub static ServicePlan: &K8sType = &K8sType {
        api_version: "servicecatalog.k8s.io/v1beta1",
        kind: "ServicePlan",
        plural_kind: "serviceplans",
        namespaced: true,
    };

    pub static ServiceInstance: &K8sType = &K8sType {
        api_version: "servicecatalog.k8s.io/v1beta1",
        kind: "ServiceInstance",
        plural_kind: "serviceinstances",
        namespaced: true,
    };

    pub static ServiceBinding: &K8sType = &K8sType {
        api_version: "servicecatalog.k8s.io/v1beta1",
        kind: "ServiceBinding",
        plural_kind: "servicebindings",
        namespaced: true,
    };
}

pub mod core {
    pub mod v1 {
        use crate::k8s_types::K8sType;

        pub static Secret: &K8sType = &K8sType {
            api_version: "v1",
            kind: "Secret",
            plural_kind: "secrets",
            namespaced: true,
        };

        pub static Namespace: &K8sType = &K8sType {
            api_version: "v1",
            kind: "Namespace",
            plural_kind: "namespaces",
            namespaced: false,
        };
    }
}
