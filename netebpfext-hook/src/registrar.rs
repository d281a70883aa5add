//! # Registrar
//!
//! In-process model of the module registrar pairing providers and clients by
//! identifier. Providers and clients register their characteristics; every
//! provider/client couple sharing the same interface identifier is bound by
//! asking the provider to attach the client. Bindings are torn down when
//! either side deregisters.
//!
//! Provider deregistration may complete asynchronously: existing bindings
//! are detached in the background and the caller has to wait for the
//! completion before releasing the provider's state.
use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread,
};

use log::{debug, error, warn};
use uuid::Uuid;

use crate::{
    data::ExtensionData,
    dispatch::ProgramDispatch,
    error::{RegistrarError, Result},
    level,
};

/// Handle of a provider or client registration.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RegistrationHandle(u64);

/// Identifier of a binding between a provider and a client. Stable for the
/// whole life of the binding, and never reused.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BindingId(u64);

impl BindingId {
    #[cfg(test)]
    pub(crate) fn test(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "binding#{}", self.0)
    }
}

/// Registration characteristics of a module.
#[derive(Clone, Debug)]
pub struct Characteristics {
    /// Interface identifier; providers and clients are matched on it.
    pub npi_id: Uuid,
    /// Identifier of the module itself.
    pub module_id: Uuid,
    /// Interface specific data, opaque to the registrar.
    pub npi_specific: ExtensionData,
}

/// Provider side of a binding.
pub trait ProviderModule: Send + Sync {
    /// A client wants to attach. Returning an error refuses the binding.
    fn attach_client(
        &self,
        binding: BindingId,
        client: &Characteristics,
        dispatch: Option<Arc<dyn ProgramDispatch>>,
    ) -> Result<()>;
    /// The binding is going away. Once this returns the provider must not
    /// use the client's dispatch table anymore. May block.
    fn detach_client(&self, binding: BindingId);
}

/// Client side of a binding.
pub trait ClientModule: Send + Sync {
    /// Dispatch table handed to providers on attach, if any.
    fn dispatch(&self) -> Option<Arc<dyn ProgramDispatch>> {
        None
    }
    /// A provider accepted the client.
    fn on_bound(&self, _binding: BindingId, _provider: &Characteristics) {}
    /// A binding was removed; the provider no longer uses the client.
    fn on_unbound(&self, _binding: BindingId) {}
}

/// Result of a provider deregistration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeregisterStatus {
    /// No binding was left, the provider is gone.
    Complete,
    /// Bindings are being detached in the background. Use
    /// `Registrar::wait_for_provider_deregister_complete`.
    Pending,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BindingState {
    Attaching,
    Bound,
    Detaching,
}

struct Binding {
    id: BindingId,
    provider: RegistrationHandle,
    client: RegistrationHandle,
    state: BindingState,
}

struct ProviderEntry {
    handle: RegistrationHandle,
    characteristics: Characteristics,
    module: Arc<dyn ProviderModule>,
    deregistering: bool,
}

struct ClientEntry {
    handle: RegistrationHandle,
    characteristics: Characteristics,
    module: Arc<dyn ClientModule>,
    deregistering: bool,
}

#[derive(Default)]
struct RegistrarState {
    next_id: u64,
    providers: Vec<ProviderEntry>,
    clients: Vec<ClientEntry>,
    bindings: Vec<Binding>,
}

impl RegistrarState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn provider(&self, handle: RegistrationHandle) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.handle == handle)
    }

    fn client(&self, handle: RegistrationHandle) -> Option<&ClientEntry> {
        self.clients.iter().find(|c| c.handle == handle)
    }

    fn binding_mut(&mut self, id: BindingId) -> Option<&mut Binding> {
        self.bindings.iter_mut().find(|b| b.id == id)
    }
}

struct RegistrarInner {
    state: Mutex<RegistrarState>,
    /// Signaled every time a binding or a registration goes away, or a
    /// binding leaves the attaching state.
    changed: Condvar,
}

/// The registrar. Cloning it gives another handle on the same registrar.
#[derive(Clone)]
pub struct Registrar {
    inner: Arc<RegistrarInner>,
}

impl Registrar {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistrarInner {
                state: Mutex::new(RegistrarState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistrarState> {
        self.inner.state.lock().unwrap()
    }

    /// Register a provider and bind it to all already registered clients
    /// sharing its interface identifier.
    pub fn register_provider(
        &self,
        characteristics: Characteristics,
        module: Arc<dyn ProviderModule>,
    ) -> Result<RegistrationHandle> {
        level::assert_blockable("Registrar::register_provider");

        let (handle, clients) = {
            let mut state = self.lock();
            if state.providers.iter().any(|p| {
                p.characteristics.npi_id == characteristics.npi_id
                    && p.characteristics.module_id == characteristics.module_id
            }) {
                return Err(RegistrarError::Duplicate.into());
            }

            let handle = RegistrationHandle(state.next_id());
            let clients: Vec<RegistrationHandle> = state
                .clients
                .iter()
                .filter(|c| c.characteristics.npi_id == characteristics.npi_id)
                .map(|c| c.handle)
                .collect();

            debug!(
                "Registering provider {} for interface {}",
                characteristics.module_id, characteristics.npi_id
            );
            state.providers.push(ProviderEntry {
                handle,
                characteristics,
                module,
                deregistering: false,
            });
            (handle, clients)
        };

        clients.into_iter().for_each(|client| self.bind(handle, client));
        Ok(handle)
    }

    /// Register a client and bind it to all registered providers sharing its
    /// interface identifier. A provider refusing the client does not make the
    /// registration fail.
    pub fn register_client(
        &self,
        characteristics: Characteristics,
        module: Arc<dyn ClientModule>,
    ) -> Result<RegistrationHandle> {
        level::assert_blockable("Registrar::register_client");

        let (handle, providers) = {
            let mut state = self.lock();
            if state.clients.iter().any(|c| {
                c.characteristics.npi_id == characteristics.npi_id
                    && c.characteristics.module_id == characteristics.module_id
            }) {
                return Err(RegistrarError::Duplicate.into());
            }

            let handle = RegistrationHandle(state.next_id());
            let providers: Vec<RegistrationHandle> = state
                .providers
                .iter()
                .filter(|p| !p.deregistering && p.characteristics.npi_id == characteristics.npi_id)
                .map(|p| p.handle)
                .collect();

            state.clients.push(ClientEntry {
                handle,
                characteristics,
                module,
                deregistering: false,
            });
            (handle, providers)
        };

        providers
            .into_iter()
            .for_each(|provider| self.bind(provider, handle));
        Ok(handle)
    }

    /// Deregister a client, detaching it from every provider it is bound to.
    /// Blocks until all its bindings are gone.
    pub fn deregister_client(&self, handle: RegistrationHandle) -> Result<()> {
        level::assert_blockable("Registrar::deregister_client");

        let bindings: Vec<BindingId> = {
            let mut state = self.lock();
            let client = state
                .clients
                .iter_mut()
                .find(|c| c.handle == handle)
                .ok_or(RegistrarError::NotFound)?;
            if client.deregistering {
                return Err(RegistrarError::Deregistering.into());
            }
            client.deregistering = true;

            state
                .bindings
                .iter()
                .filter(|b| b.client == handle)
                .map(|b| b.id)
                .collect()
        };

        bindings.into_iter().for_each(|id| self.unbind(id));

        // Bindings concurrently detached by a provider deregistration are
        // not ours to remove, but we still have to wait for them.
        let mut state = self.lock();
        while state.bindings.iter().any(|b| b.client == handle) {
            state = self.inner.changed.wait(state).unwrap();
        }
        state.clients.retain(|c| c.handle != handle);
        Ok(())
    }

    /// Deregister a provider. No new client will be bound to it; existing
    /// bindings are detached in the background, in which case `Pending` is
    /// returned and the caller must wait for the completion.
    pub fn deregister_provider(&self, handle: RegistrationHandle) -> Result<DeregisterStatus> {
        level::assert_blockable("Registrar::deregister_provider");

        let bindings: Vec<BindingId> = {
            let mut state = self.lock();
            let provider = state
                .providers
                .iter_mut()
                .find(|p| p.handle == handle)
                .ok_or(RegistrarError::NotFound)?;
            if provider.deregistering {
                return Err(RegistrarError::Deregistering.into());
            }
            provider.deregistering = true;

            let bindings: Vec<BindingId> = state
                .bindings
                .iter()
                .filter(|b| b.provider == handle)
                .map(|b| b.id)
                .collect();

            if bindings.is_empty() {
                state.providers.retain(|p| p.handle != handle);
                self.inner.changed.notify_all();
                return Ok(DeregisterStatus::Complete);
            }
            bindings
        };

        debug!(
            "Provider deregistration pending, {} binding(s) left",
            bindings.len()
        );

        let registrar = self.clone();
        let worker = thread::Builder::new()
            .name("registrar-deregister".to_string())
            .spawn(move || registrar.finish_provider_deregistration(handle));

        if let Err(e) = worker {
            // Do the work ourselves rather than leaving the provider half
            // deregistered.
            error!("Could not spawn the deregistration worker ({e}), detaching inline");
            self.finish_provider_deregistration(handle);
            return Ok(DeregisterStatus::Complete);
        }

        Ok(DeregisterStatus::Pending)
    }

    fn finish_provider_deregistration(&self, handle: RegistrationHandle) {
        let bindings: Vec<BindingId> = self
            .lock()
            .bindings
            .iter()
            .filter(|b| b.provider == handle)
            .map(|b| b.id)
            .collect();
        bindings.into_iter().for_each(|id| self.unbind(id));

        let mut state = self.lock();
        while state.bindings.iter().any(|b| b.provider == handle) {
            state = self.inner.changed.wait(state).unwrap();
        }
        state.providers.retain(|p| p.handle != handle);
        self.inner.changed.notify_all();
    }

    /// Block until a pending provider deregistration completes.
    pub fn wait_for_provider_deregister_complete(&self, handle: RegistrationHandle) {
        level::assert_blockable("Registrar::wait_for_provider_deregister_complete");

        let mut state = self.lock();
        while state.provider(handle).is_some() {
            state = self.inner.changed.wait(state).unwrap();
        }
    }

    /// Bindings currently involving the given provider or client.
    pub fn bindings_of(&self, handle: RegistrationHandle) -> Vec<BindingId> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.provider == handle || b.client == handle)
            .map(|b| b.id)
            .collect()
    }

    /// Is the given handle a live provider or client registration?
    pub fn is_registered(&self, handle: RegistrationHandle) -> bool {
        let state = self.lock();
        state.provider(handle).is_some() || state.client(handle).is_some()
    }

    fn bind(&self, provider: RegistrationHandle, client: RegistrationHandle) {
        let (id, provider_module, provider_chars, client_module, client_chars) = {
            let mut state = self.lock();
            let (provider_module, provider_chars) = match state.provider(provider) {
                Some(p) if !p.deregistering => (p.module.clone(), p.characteristics.clone()),
                _ => return,
            };
            let (client_module, client_chars) = match state.client(client) {
                Some(c) if !c.deregistering => (c.module.clone(), c.characteristics.clone()),
                _ => return,
            };

            let id = BindingId(state.next_id());
            state.bindings.push(Binding {
                id,
                provider,
                client,
                state: BindingState::Attaching,
            });
            (
                id,
                provider_module,
                provider_chars,
                client_module,
                client_chars,
            )
        };

        match provider_module.attach_client(id, &client_chars, client_module.dispatch()) {
            Ok(()) => {
                debug!(
                    "Bound client {} to provider {} ({id})",
                    client_chars.module_id, provider_chars.module_id
                );
                // Notify the client before the binding can be detached, so
                // it never sees an unbind before the bind.
                client_module.on_bound(id, &provider_chars);
                if let Some(binding) = self.lock().binding_mut(id) {
                    binding.state = BindingState::Bound;
                }
                self.inner.changed.notify_all();
            }
            Err(e) => {
                self.lock().bindings.retain(|b| b.id != id);
                self.inner.changed.notify_all();
                warn!(
                    "Provider {} refused client {}: {e}",
                    provider_chars.module_id, client_chars.module_id
                );
            }
        }
    }

    fn unbind(&self, id: BindingId) {
        let (provider_module, client_module) = {
            let mut state = self.lock();
            loop {
                match state.bindings.iter().find(|b| b.id == id).map(|b| b.state) {
                    Some(BindingState::Attaching) => {
                        state = self.inner.changed.wait(state).unwrap();
                    }
                    // Someone else is already detaching it, or it is gone.
                    Some(BindingState::Detaching) | None => return,
                    Some(BindingState::Bound) => break,
                }
            }

            let (provider, client) = match state.binding_mut(id) {
                Some(binding) => {
                    binding.state = BindingState::Detaching;
                    (binding.provider, binding.client)
                }
                None => return,
            };
            (
                state.provider(provider).map(|p| p.module.clone()),
                state.client(client).map(|c| c.module.clone()),
            )
        };

        if let Some(provider) = provider_module {
            provider.detach_client(id);
        }
        if let Some(client) = client_module {
            client.on_unbound(id);
        }

        self.lock().bindings.retain(|b| b.id != id);
        self.inner.changed.notify_all();
        debug!("Removed {id}");
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::error::HookError;

    #[derive(Default)]
    struct FakeProvider {
        refuse: AtomicBool,
        attached: AtomicUsize,
        detached: AtomicUsize,
    }

    impl ProviderModule for FakeProvider {
        fn attach_client(
            &self,
            _: BindingId,
            _: &Characteristics,
            _: Option<Arc<dyn ProgramDispatch>>,
        ) -> Result<()> {
            if self.refuse.load(Ordering::Acquire) {
                return Err(HookError::AccessDenied("refused".to_string()));
            }
            self.attached.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        fn detach_client(&self, _: BindingId) {
            self.detached.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[derive(Default)]
    struct FakeClient {
        bound: AtomicUsize,
        unbound: AtomicUsize,
    }

    impl ClientModule for FakeClient {
        fn on_bound(&self, _: BindingId, _: &Characteristics) {
            self.bound.fetch_add(1, Ordering::AcqRel);
        }

        fn on_unbound(&self, _: BindingId) {
            self.unbound.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn chars(npi_id: Uuid) -> Characteristics {
        Characteristics {
            npi_id,
            module_id: Uuid::new_v4(),
            npi_specific: ExtensionData::empty(),
        }
    }

    #[test]
    fn duplicate_provider() {
        let registrar = Registrar::new();
        let c = chars(Uuid::new_v4());

        assert!(registrar
            .register_provider(c.clone(), Arc::new(FakeProvider::default()))
            .is_ok());
        assert_eq!(
            registrar
                .register_provider(c, Arc::new(FakeProvider::default()))
                .unwrap_err(),
            HookError::Registrar(RegistrarError::Duplicate)
        );
    }

    #[test]
    fn bind_both_orders() {
        let registrar = Registrar::new();
        let npi = Uuid::new_v4();
        let provider = Arc::new(FakeProvider::default());
        let early = Arc::new(FakeClient::default());
        let late = Arc::new(FakeClient::default());

        // Client registered before the provider.
        let early_handle = registrar.register_client(chars(npi), early.clone()).unwrap();
        let provider_handle = registrar
            .register_provider(chars(npi), provider.clone())
            .unwrap();
        // Client registered after the provider.
        let late_handle = registrar.register_client(chars(npi), late.clone()).unwrap();
        // Client for another interface.
        let other = Arc::new(FakeClient::default());
        registrar
            .register_client(chars(Uuid::new_v4()), other.clone())
            .unwrap();

        assert_eq!(provider.attached.load(Ordering::Acquire), 2);
        assert_eq!(early.bound.load(Ordering::Acquire), 1);
        assert_eq!(late.bound.load(Ordering::Acquire), 1);
        assert_eq!(other.bound.load(Ordering::Acquire), 0);
        assert_eq!(registrar.bindings_of(provider_handle).len(), 2);

        registrar.deregister_client(early_handle).unwrap();
        assert_eq!(provider.detached.load(Ordering::Acquire), 1);
        assert_eq!(early.unbound.load(Ordering::Acquire), 1);
        assert!(!registrar.is_registered(early_handle));
        assert!(registrar.bindings_of(early_handle).is_empty());

        registrar.deregister_client(late_handle).unwrap();
        assert_eq!(
            registrar.deregister_provider(provider_handle).unwrap(),
            DeregisterStatus::Complete
        );
        assert!(!registrar.is_registered(provider_handle));
    }

    #[test]
    fn refused_binding() {
        let registrar = Registrar::new();
        let npi = Uuid::new_v4();
        let provider = Arc::new(FakeProvider::default());
        provider.refuse.store(true, Ordering::Release);
        let client = Arc::new(FakeClient::default());

        let provider_handle = registrar
            .register_provider(chars(npi), provider.clone())
            .unwrap();
        let client_handle = registrar.register_client(chars(npi), client.clone()).unwrap();

        assert!(registrar.is_registered(client_handle));
        assert!(registrar.bindings_of(provider_handle).is_empty());
        assert_eq!(client.bound.load(Ordering::Acquire), 0);

        registrar.deregister_client(client_handle).unwrap();
        assert_eq!(provider.detached.load(Ordering::Acquire), 0);
        assert_eq!(client.unbound.load(Ordering::Acquire), 0);
    }

    #[test]
    fn pending_provider_deregistration() {
        let registrar = Registrar::new();
        let npi = Uuid::new_v4();
        let provider = Arc::new(FakeProvider::default());
        let client = Arc::new(FakeClient::default());

        let provider_handle = registrar
            .register_provider(chars(npi), provider.clone())
            .unwrap();
        let client_handle = registrar.register_client(chars(npi), client.clone()).unwrap();

        assert_eq!(
            registrar.deregister_provider(provider_handle).unwrap(),
            DeregisterStatus::Pending
        );
        assert_eq!(
            registrar.deregister_provider(provider_handle).unwrap_err(),
            HookError::Registrar(RegistrarError::Deregistering)
        );
        registrar.wait_for_provider_deregister_complete(provider_handle);

        assert!(!registrar.is_registered(provider_handle));
        assert_eq!(provider.detached.load(Ordering::Acquire), 1);
        assert_eq!(client.unbound.load(Ordering::Acquire), 1);

        // The client survives its provider.
        assert!(registrar.is_registered(client_handle));
        assert!(registrar.bindings_of(client_handle).is_empty());
        registrar.deregister_client(client_handle).unwrap();
    }

    #[test]
    fn unknown_handles() {
        let registrar = Registrar::new();

        assert_eq!(
            registrar
                .deregister_client(RegistrationHandle(42))
                .unwrap_err(),
            HookError::Registrar(RegistrarError::NotFound)
        );
        assert_eq!(
            registrar
                .deregister_provider(RegistrationHandle(42))
                .unwrap_err(),
            HookError::Registrar(RegistrarError::NotFound)
        );
        // Nothing to wait for.
        registrar.wait_for_provider_deregister_complete(RegistrationHandle(42));
    }

    #[test]
    #[should_panic(expected = "Registrar::deregister_provider may block")]
    fn deregister_provider_at_dispatch() {
        let registrar = Registrar::new();
        let handle = registrar
            .register_provider(chars(Uuid::new_v4()), Arc::new(FakeProvider::default()))
            .unwrap();

        let _level = level::raise_to_dispatch();
        let _ = registrar.deregister_provider(handle);
    }
}
