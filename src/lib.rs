//! A reconciliation control plane for Open Service Broker (OSB) brokers. Users declare brokers,
//! service instances and bindings as resources in a store, and the controllers in this crate
//! drive each broker's OSB API until the broker's view matches what was declared.
//!
//! Three reconcilers do the work:
//!
//! - the broker reconciler fetches each broker's catalog and mirrors it into `ServiceClass` and
//!   `ServicePlan` resources
//! - the instance reconciler provisions, updates and deprovisions `ServiceInstance`s, polling
//!   asynchronous operations and cleaning up after ambiguous failures
//! - the binding reconciler binds to instances and writes the credentials into a `Secret`
//!
//! All state lives in a `store::Store`. The crate ships an `InMemoryStore` that runs the same
//! admission chain a real deployment would.
//!
//! ```no_run
//! use osb_controller::prelude::*;
//! use std::sync::Arc;
//!
//! let config = ControllerConfig::new("osb-controller")
//!     .cluster_id("my-cluster")
//!     .worker_count(2);
//! let store = Arc::new(InMemoryStore::with_standard_admission());
//!
//! // blocks the current thread while the controllers run
//! let err = run_controllers(config, store);
//! eprintln!("controllers stopped: {}", err);
//! ```
//!
//! With the `testkit` feature enabled, `runner::testkit::TestKit` drives the reconcilers against an
//! in-memory store and a scripted fake broker.

#[macro_use]
extern crate serde_derive;

pub mod admission;
pub mod checksum;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod filter;
pub mod handler;
pub mod k8s_types;
pub mod osb;
pub mod resource;
pub mod runner;
pub mod store;

pub use serde;
pub use serde_json;
pub use serde_yaml;

pub mod prelude {
    pub use crate::config::ControllerConfig;
    pub use crate::controller::{BindingReconciler, BrokerReconciler, ControllerContext, InstanceReconciler};
    pub use crate::error::Error;
    pub use crate::handler::{ErrorKind, ReconcileError, ReconcileResult, Reconciler};
    pub use crate::k8s_types::{self, K8sType};
    pub use crate::osb::{BrokerClient, BrokerClientFactory, OsbError};
    pub use crate::resource::{
        Broker, ObjectId, ObjectIdRef, Resource, Scope, Secret, ServiceBinding, ServiceClass,
        ServiceInstance, ServicePlan,
    };
    pub use crate::runner::{run_controllers, start_controllers, ControllerHandle};
    pub use crate::store::{Api, InMemoryStore, ListParams, Store};
    pub use serde::{Deserialize, Serialize};
}
