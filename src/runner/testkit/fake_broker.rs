use crate::osb::{
    BindRequest, BindResponse, BindingLastOperationRequest, BrokerClient, BrokerClientConfig,
    BrokerClientFactory, CatalogResponse, DeprovisionRequest, DeprovisionResponse,
    GetBindingRequest, GetBindingResponse, LastOperationRequest, LastOperationResponse,
    LastOperationState, OsbError, ProvisionRequest, ProvisionResponse, UnbindRequest,
    UnbindResponse, UpdateInstanceRequest, UpdateInstanceResponse,
};
use crate::resource::JsonObject;

use async_trait::async_trait;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

type Script<T> = VecDeque<Result<T, OsbError>>;

#[derive(Debug, Default)]
struct FakeState {
    catalog: CatalogResponse,

    catalog_results: Script<CatalogResponse>,
    provision_results: Script<ProvisionResponse>,
    update_results: Script<UpdateInstanceResponse>,
    deprovision_results: Script<DeprovisionResponse>,
    poll_results: Script<LastOperationResponse>,
    poll_binding_results: Script<LastOperationResponse>,
    bind_results: Script<BindResponse>,
    get_binding_results: Script<GetBindingResponse>,
    unbind_results: Script<UnbindResponse>,

    catalog_calls: usize,
    provisions: Vec<ProvisionRequest>,
    updates: Vec<UpdateInstanceRequest>,
    deprovisions: Vec<DeprovisionRequest>,
    polls: Vec<LastOperationRequest>,
    binding_polls: Vec<BindingLastOperationRequest>,
    binds: Vec<BindRequest>,
    get_bindings: Vec<GetBindingRequest>,
    unbinds: Vec<UnbindRequest>,
    configs: Vec<BrokerClientConfig>,
}

/// A broker that answers from scripts. Every operation pops the next scripted result, and
/// falls back to a synchronous success once its script runs out. Every request is recorded.
/// Clones share the same state, so a test can keep a handle while the controllers use another.
#[derive(Debug, Clone, Default)]
pub struct FakeBrokerClient {
    state: Arc<Mutex<FakeState>>,
}

macro_rules! scripted {
    ($script_fn:ident, $script:ident, $calls_fn:ident, $calls:ident, $response:ty, $request:ty) => {
        pub fn $script_fn(&self, result: Result<$response, OsbError>) {
            self.lock().$script.push_back(result);
        }

        pub fn $calls_fn(&self) -> Vec<$request> {
            self.lock().$calls.clone()
        }
    };
}

impl FakeBrokerClient {
    pub fn new() -> FakeBrokerClient {
        FakeBrokerClient::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The catalog returned whenever no catalog result is scripted
    pub fn set_catalog(&self, catalog: CatalogResponse) {
        self.lock().catalog = catalog;
    }

    pub fn on_catalog(&self, result: Result<CatalogResponse, OsbError>) {
        self.lock().catalog_results.push_back(result);
    }

    pub fn catalog_calls(&self) -> usize {
        self.lock().catalog_calls
    }

    scripted!(on_provision, provision_results, provision_calls, provisions, ProvisionResponse, ProvisionRequest);
    scripted!(on_update, update_results, update_calls, updates, UpdateInstanceResponse, UpdateInstanceRequest);
    scripted!(on_deprovision, deprovision_results, deprovision_calls, deprovisions, DeprovisionResponse, DeprovisionRequest);
    scripted!(on_poll, poll_results, poll_calls, polls, LastOperationResponse, LastOperationRequest);
    scripted!(
        on_poll_binding,
        poll_binding_results,
        poll_binding_calls,
        binding_polls,
        LastOperationResponse,
        BindingLastOperationRequest
    );
    scripted!(on_bind, bind_results, bind_calls, binds, BindResponse, BindRequest);
    scripted!(on_get_binding, get_binding_results, get_binding_calls, get_bindings, GetBindingResponse, GetBindingRequest);
    scripted!(on_unbind, unbind_results, unbind_calls, unbinds, UnbindResponse, UnbindRequest);

    /// Every client config the controllers asked for a client with
    pub fn client_configs(&self) -> Vec<BrokerClientConfig> {
        self.lock().configs.clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBrokerClient {
    async fn get_catalog(&self) -> Result<CatalogResponse, OsbError> {
        let mut state = self.lock();
        state.catalog_calls += 1;
        match state.catalog_results.pop_front() {
            Some(result) => result,
            None => Ok(state.catalog.clone()),
        }
    }

    async fn provision_instance(&self, request: &ProvisionRequest) -> Result<ProvisionResponse, OsbError> {
        let mut state = self.lock();
        state.provisions.push(request.clone());
        state
            .provision_results
            .pop_front()
            .unwrap_or_else(|| Ok(ProvisionResponse::default()))
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, OsbError> {
        let mut state = self.lock();
        state.updates.push(request.clone());
        state
            .update_results
            .pop_front()
            .unwrap_or_else(|| Ok(UpdateInstanceResponse::default()))
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, OsbError> {
        let mut state = self.lock();
        state.deprovisions.push(request.clone());
        state
            .deprovision_results
            .pop_front()
            .unwrap_or_else(|| Ok(DeprovisionResponse::default()))
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        let mut state = self.lock();
        state.polls.push(request.clone());
        state
            .poll_results
            .pop_front()
            .unwrap_or_else(|| Ok(LastOperationResponse::new(LastOperationState::Succeeded)))
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, OsbError> {
        let mut state = self.lock();
        state.binding_polls.push(request.clone());
        state
            .poll_binding_results
            .pop_front()
            .unwrap_or_else(|| Ok(LastOperationResponse::new(LastOperationState::Succeeded)))
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, OsbError> {
        let mut state = self.lock();
        state.binds.push(request.clone());
        state.bind_results.pop_front().unwrap_or_else(|| {
            Ok(BindResponse {
                is_async: false,
                credentials: Some(JsonObject::new()),
                operation_key: None,
            })
        })
    }

    async fn get_binding(&self, request: &GetBindingRequest) -> Result<GetBindingResponse, OsbError> {
        let mut state = self.lock();
        state.get_bindings.push(request.clone());
        state.get_binding_results.pop_front().unwrap_or_else(|| {
            Ok(GetBindingResponse {
                credentials: Some(JsonObject::new()),
            })
        })
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, OsbError> {
        let mut state = self.lock();
        state.unbinds.push(request.clone());
        state
            .unbind_results
            .pop_front()
            .unwrap_or_else(|| Ok(UnbindResponse::default()))
    }
}

/// Hands the same fake to every broker
impl BrokerClientFactory for FakeBrokerClient {
    fn client_for(&self, config: &BrokerClientConfig) -> Result<Arc<dyn BrokerClient>, OsbError> {
        self.lock().configs.push(config.clone());
        Ok(Arc::new(self.clone()))
    }
}
