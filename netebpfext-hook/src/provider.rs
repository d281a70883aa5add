//! # Hook provider
//!
//! One hook provider exists per hook point. It registers with the registrar
//! under the hook's attach type, lets the hook module accept or refuse
//! attaching clients, and owns the set of attached clients.
//!
//! The client set is protected by a non-sleeping reader-writer lock so it
//! can be enumerated from the invocation path at dispatch level. Invocations
//! only take it for reading and never serialize each other: they are
//! protected against detachment by each client's rundown protection only.
use std::{
    collections::TryReserveError,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    client::{ClientId, HookClient},
    data::ExtensionData,
    dispatch::ProgramDispatch,
    error::{AttachDenial, HookError, Result},
    level::{self, ExecutionLevel},
    registrar::{
        BindingId, Characteristics, DeregisterStatus, ProviderModule, Registrar,
        RegistrationHandle,
    },
};

/// Registration parameters of a hook provider.
#[derive(Clone, Debug)]
pub struct HookProviderParameters {
    /// Human readable name of the hook, for logging.
    pub name: String,
    /// Attach type of the hook; clients attach using it.
    pub attach_type: Uuid,
    /// Module identifier of the provider.
    pub provider_module_id: Uuid,
    /// Provider data handed to attaching clients.
    pub provider_data: ExtensionData,
    /// Program types which can be attached to the hook.
    pub supported_program_types: Vec<Uuid>,
    pub execution_level: ExecutionLevel,
}

impl HookProviderParameters {
    fn validate(&self) -> Result<()> {
        if self.attach_type.is_nil() {
            return Err(HookError::InvalidArgument(format!(
                "{}: nil attach type",
                self.name
            )));
        }
        if self.provider_module_id.is_nil() {
            return Err(HookError::InvalidArgument(format!(
                "{}: nil provider module id",
                self.name
            )));
        }
        Ok(())
    }
}

/// Callbacks implemented by hook modules.
pub trait HookModule: Send + Sync {
    /// A client is attaching. It becomes eligible for invocation only if
    /// this returns `Ok`.
    fn on_client_attach(&self, client: &HookClient) -> std::result::Result<(), AttachDenial>;
    /// A client is detaching. Notification only, it can't be refused. The
    /// client may still be in use by in-flight invocations.
    fn on_client_detach(&self, client: &HookClient);
}

/// Hook module built from a pair of closures.
pub struct FnHookModule<A, D> {
    attach: A,
    detach: D,
}

impl<A, D> FnHookModule<A, D>
where
    A: Fn(&HookClient) -> std::result::Result<(), AttachDenial> + Send + Sync,
    D: Fn(&HookClient) + Send + Sync,
{
    pub fn new(attach: A, detach: D) -> Self {
        Self { attach, detach }
    }
}

impl<A, D> HookModule for FnHookModule<A, D>
where
    A: Fn(&HookClient) -> std::result::Result<(), AttachDenial> + Send + Sync,
    D: Fn(&HookClient) + Send + Sync,
{
    fn on_client_attach(&self, client: &HookClient) -> std::result::Result<(), AttachDenial> {
        (self.attach)(client)
    }

    fn on_client_detach(&self, client: &HookClient) {
        (self.detach)(client)
    }
}

/// Attach and detach counters of a provider.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ProviderStats {
    pub attached: u64,
    pub denied: u64,
    pub detached: u64,
}

pub struct HookProvider {
    params: HookProviderParameters,
    module: Box<dyn HookModule>,
    registrar: Registrar,
    handle: OnceLock<RegistrationHandle>,
    /// Attached clients, in attach order. Only mutated by attach & detach.
    clients: spin::RwLock<Vec<Arc<HookClient>>>,
    attached: AtomicU64,
    denied: AtomicU64,
    detached: AtomicU64,
}

impl HookProvider {
    /// Register a hook provider. Clients already registered for the attach
    /// type are offered to the hook module before this returns.
    pub fn register<M>(
        registrar: &Registrar,
        params: HookProviderParameters,
        module: M,
    ) -> Result<Arc<Self>>
    where
        M: HookModule + 'static,
    {
        level::assert_blockable("HookProvider::register");
        params.validate()?;

        let characteristics = Characteristics {
            npi_id: params.attach_type,
            module_id: params.provider_module_id,
            npi_specific: params.provider_data.clone(),
        };

        let provider = Arc::new(Self {
            params,
            module: Box::new(module),
            registrar: registrar.clone(),
            handle: OnceLock::new(),
            clients: spin::RwLock::new(Vec::new()),
            attached: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            detached: AtomicU64::new(0),
        });

        let handle = registrar.register_provider(characteristics, provider.clone())?;
        // Can't fail, we're the only one setting it.
        let _ = provider.handle.set(handle);

        info!(
            "Registered {} hook provider (attach type {}, {} level)",
            provider.params.name, provider.params.attach_type, provider.params.execution_level
        );
        Ok(provider)
    }

    /// Deregister the provider and wait for the deregistration to complete.
    /// All clients must have been detached before.
    pub fn unregister(self: Arc<Self>) -> Result<()> {
        level::assert_blockable("HookProvider::unregister");

        let attached = self.clients.read().len();
        if attached != 0 {
            panic!(
                "{} hook provider unregistered with {attached} attached client(s)",
                self.params.name
            );
        }

        if let Some(handle) = self.handle.get() {
            match self.registrar.deregister_provider(*handle)? {
                DeregisterStatus::Complete => (),
                DeregisterStatus::Pending => {
                    debug!("{}: waiting for deregistration", self.params.name);
                    self.registrar.wait_for_provider_deregister_complete(*handle);
                }
            }
        }

        info!("Unregistered {} hook provider", self.params.name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn attach_type(&self) -> Uuid {
        self.params.attach_type
    }

    pub fn execution_level(&self) -> ExecutionLevel {
        self.params.execution_level
    }

    pub fn provider_data(&self) -> &ExtensionData {
        &self.params.provider_data
    }

    pub fn supported_program_types(&self) -> &[Uuid] {
        &self.params.supported_program_types
    }

    pub fn registration_handle(&self) -> Option<RegistrationHandle> {
        self.handle.get().copied()
    }

    /// First attached client, if any. This is the client hooks invoke.
    pub fn get_attached_client(&self) -> Option<Arc<HookClient>> {
        self.clients.read().first().cloned()
    }

    /// Client attached after `client`, or the first attached client if
    /// `client` is `None`. Returns `None` at the end of the set, or if
    /// `client` is no longer attached.
    pub fn get_next_attached_client(&self, client: Option<&HookClient>) -> Option<Arc<HookClient>> {
        let clients = self.clients.read();
        match client {
            None => clients.first().cloned(),
            Some(client) => {
                let pos = clients.iter().position(|c| c.id() == client.id())?;
                clients.get(pos + 1).cloned()
            }
        }
    }

    /// Iterate over the attached clients. Each step takes the client set lock
    /// on its own; clients attached or detached while iterating may or may
    /// not be seen.
    pub fn attached_clients(&self) -> AttachedClients<'_> {
        AttachedClients {
            provider: self,
            current: None,
            done: false,
        }
    }

    /// Look up an attached client by its handle.
    pub fn client(&self, id: ClientId) -> Option<Arc<HookClient>> {
        self.clients.read().iter().find(|c| c.id() == id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            attached: self.attached.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            detached: self.detached.load(Ordering::Relaxed),
        }
    }
}

impl HookProvider {
    /// Account for an accepted client, or undo its acceptance if it could
    /// not be inserted in the client set.
    fn finish_attach(
        &self,
        client: &HookClient,
        inserted: std::result::Result<(), TryReserveError>,
    ) -> Result<()> {
        if inserted.is_err() {
            // The hook module accepted the client, let it undo whatever it
            // did before dropping it.
            self.module.on_client_detach(client);
            return Err(HookError::NoMemory);
        }

        self.attached.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{}: attached client {} ({})",
            self.params.name,
            client.module_id(),
            client.id()
        );
        Ok(())
    }
}

impl ProviderModule for HookProvider {
    fn attach_client(
        &self,
        binding: BindingId,
        client: &Characteristics,
        dispatch: Option<Arc<dyn ProgramDispatch>>,
    ) -> Result<()> {
        let dispatch = dispatch.ok_or_else(|| {
            HookError::InvalidArgument(format!(
                "client {} has no program dispatch table",
                client.module_id
            ))
        })?;

        let hook_client = Arc::new(HookClient::new(
            binding,
            client.module_id,
            self.params.attach_type,
            client.npi_specific.clone(),
            dispatch,
            self.params.execution_level,
        ));

        if let Err(denial) = self.module.on_client_attach(&hook_client) {
            self.denied.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}: client {} refused ({denial:?})",
                self.params.name, client.module_id
            );
            return Err(denial.into());
        }

        let inserted = {
            let mut clients = self.clients.write();
            clients
                .try_reserve(1)
                .map(|()| clients.push(hook_client.clone()))
        };
        self.finish_attach(&hook_client, inserted)
    }

    fn detach_client(&self, binding: BindingId) {
        level::assert_blockable("HookProvider::detach_client");

        let client = {
            let mut clients = self.clients.write();
            let pos = clients.iter().position(|c| c.id() == binding);
            pos.map(|pos| clients.remove(pos))
        };
        let client = match client {
            Some(client) => client,
            None => {
                warn!("{}: no client for {binding}", self.params.name);
                return;
            }
        };

        self.module.on_client_detach(&client);
        // Wait for in-flight invocations; none can start from now on.
        client.rundown().deactivate_and_wait();

        self.detached.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{}: detached client {} ({binding})",
            self.params.name,
            client.module_id()
        );
    }
}

/// Iterator over the clients attached to a provider, in attach order.
pub struct AttachedClients<'a> {
    provider: &'a HookProvider,
    current: Option<Arc<HookClient>>,
    done: bool,
}

impl Iterator for AttachedClients<'_> {
    type Item = Arc<HookClient>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let next = self
            .provider
            .get_next_attached_client(self.current.as_deref());
        match &next {
            Some(client) => self.current = Some(client.clone()),
            None => self.done = true,
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use std::{
        any::Any,
        sync::{
            atomic::{AtomicBool, AtomicUsize},
            Weak,
        },
        thread,
        time::Duration,
    };

    use test_case::test_case;

    use super::*;
    use crate::{
        dispatch::{invoke_first_attached, InvokeOutcome},
        error::RegistrarError,
        link::Link,
    };

    struct AcceptAll;

    impl HookModule for AcceptAll {
        fn on_client_attach(&self, _: &HookClient) -> std::result::Result<(), AttachDenial> {
            Ok(())
        }

        fn on_client_detach(&self, _: &HookClient) {}
    }

    fn params(level: ExecutionLevel) -> HookProviderParameters {
        HookProviderParameters {
            name: "test".to_string(),
            attach_type: Uuid::new_v4(),
            provider_module_id: Uuid::new_v4(),
            provider_data: ExtensionData::from_bytes(&[0xaa]),
            supported_program_types: vec![Uuid::new_v4()],
            execution_level: level,
        }
    }

    fn program(result: u32) -> Arc<dyn ProgramDispatch> {
        Arc::new(move |_: &mut dyn Any| -> Result<u32> { Ok(result) })
    }

    #[test]
    fn register_invalid() {
        let registrar = Registrar::new();

        let mut p = params(ExecutionLevel::Dispatch);
        p.attach_type = Uuid::nil();
        assert!(matches!(
            HookProvider::register(&registrar, p, AcceptAll),
            Err(HookError::InvalidArgument(_))
        ));

        let mut p = params(ExecutionLevel::Dispatch);
        p.provider_module_id = Uuid::nil();
        assert!(matches!(
            HookProvider::register(&registrar, p, AcceptAll),
            Err(HookError::InvalidArgument(_))
        ));
    }

    #[test]
    fn register_duplicate() -> anyhow::Result<()> {
        let registrar = Registrar::new();
        let p = params(ExecutionLevel::Passive);

        let provider = HookProvider::register(&registrar, p.clone(), AcceptAll)?;
        assert_eq!(provider.execution_level(), ExecutionLevel::Passive);
        assert_eq!(provider.provider_data().data(), &[0xaa]);
        assert_eq!(provider.supported_program_types().len(), 1);
        assert!(provider.registration_handle().is_some());
        assert_eq!(
            HookProvider::register(&registrar, p, AcceptAll).err(),
            Some(HookError::Registrar(RegistrarError::Duplicate))
        );

        provider.unregister()?;
        Ok(())
    }

    #[test]
    fn attach_then_detach() -> anyhow::Result<()> {
        let registrar = Registrar::new();
        let provider =
            HookProvider::register(&registrar, params(ExecutionLevel::Dispatch), AcceptAll)?;

        let link = Link::attach(
            &registrar,
            provider.attach_type(),
            ExtensionData::from_bytes(&[1, 2]),
            program(0),
        )?;
        assert!(link.is_bound());

        let client = provider.get_attached_client().unwrap();
        assert_eq!(client.client_data().data(), &[1, 2]);
        assert_eq!(client.module_id(), link.module_id());
        assert_eq!(client.attach_type(), provider.attach_type());
        assert_eq!(client.execution_level(), ExecutionLevel::Dispatch);
        assert!(provider.client(client.id()).is_some());
        let weak: Weak<HookClient> = Arc::downgrade(&client);
        drop(client);

        link.detach()?;
        // Nothing holds the client anymore.
        assert!(weak.upgrade().is_none());
        assert_eq!(provider.client_count(), 0);
        assert_eq!(
            provider.stats(),
            ProviderStats {
                attached: 1,
                denied: 0,
                detached: 1,
            }
        );

        provider.unregister()?;
        Ok(())
    }

    #[test_case(AttachDenial::AccessDenied("policy".to_string()) ; "access denied")]
    #[test_case(AttachDenial::InvalidArgument("data".to_string()) ; "invalid argument")]
    fn attach_denied(denial: AttachDenial) -> anyhow::Result<()> {
        let registrar = Registrar::new();
        let detached = Arc::new(AtomicUsize::new(0));
        let module = {
            let detached = detached.clone();
            FnHookModule::new(
                move |_: &HookClient| Err(denial.clone()),
                move |_: &HookClient| {
                    detached.fetch_add(1, Ordering::AcqRel);
                },
            )
        };
        let provider = HookProvider::register(&registrar, params(ExecutionLevel::Dispatch), module)?;

        let prog = program(0);
        let link = Link::attach(
            &registrar,
            provider.attach_type(),
            ExtensionData::empty(),
            prog.clone(),
        )?;

        assert!(!link.is_bound());
        assert_eq!(provider.client_count(), 0);
        assert!(provider.get_attached_client().is_none());
        assert_eq!(provider.stats().denied, 1);
        assert_eq!(provider.stats().attached, 0);
        // Only held by us and the link: the refused client is gone.
        assert_eq!(Arc::strong_count(&prog), 2);

        link.detach()?;
        assert_eq!(detached.load(Ordering::Acquire), 0);
        provider.unregister()?;
        Ok(())
    }

    #[test]
    fn enumeration() -> anyhow::Result<()> {
        let registrar = Registrar::new();
        let provider =
            HookProvider::register(&registrar, params(ExecutionLevel::Dispatch), AcceptAll)?;
        assert!(provider.get_next_attached_client(None).is_none());

        let links = (0..3)
            .map(|i| {
                Link::attach(
                    &registrar,
                    provider.attach_type(),
                    ExtensionData::from_bytes(&[i]),
                    program(i as u32),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        // Keep invoking while enumerating.
        let stop = Arc::new(AtomicBool::new(false));
        let invoker = {
            let (provider, stop) = (provider.clone(), stop.clone());
            thread::spawn(move || {
                let _level = level::raise_to_dispatch();
                while !stop.load(Ordering::Acquire) {
                    assert_eq!(
                        invoke_first_attached(&provider, ExecutionLevel::Dispatch, &mut ()),
                        Ok(InvokeOutcome::Invoked(0))
                    );
                }
            })
        };

        let mut seen = Vec::new();
        let mut cursor = provider.get_next_attached_client(None);
        while let Some(client) = cursor {
            seen.push(client.client_data().data()[0]);
            cursor = provider.get_next_attached_client(Some(&client));
        }
        assert_eq!(seen, vec![0, 1, 2]);

        let ids: Vec<ClientId> = provider.attached_clients().map(|c| c.id()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], provider.get_attached_client().unwrap().id());

        stop.store(true, Ordering::Release);
        invoker.join().unwrap();

        // A detached client has no successor.
        let second = provider.get_next_attached_client(provider.get_attached_client().as_deref());
        let second = second.unwrap();
        links.into_iter().try_for_each(|l| l.detach())?;
        assert!(provider.get_next_attached_client(Some(&second)).is_none());
        assert_eq!(
            invoke_first_attached(&provider, ExecutionLevel::Dispatch, &mut ()),
            Ok(InvokeOutcome::NotInvoked)
        );

        provider.unregister()?;
        Ok(())
    }

    #[test]
    fn detach_waits_for_invocations() -> anyhow::Result<()> {
        const INFLIGHT: usize = 3;
        let registrar = Registrar::new();
        let detach_notified = Arc::new(AtomicBool::new(false));
        let module = {
            let detach_notified = detach_notified.clone();
            FnHookModule::new(
                |_: &HookClient| Ok(()),
                move |_: &HookClient| detach_notified.store(true, Ordering::Release),
            )
        };
        let provider = HookProvider::register(&registrar, params(ExecutionLevel::Dispatch), module)?;

        let running = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(AtomicBool::new(false));
        let prog: Arc<dyn ProgramDispatch> = {
            let (running, release) = (running.clone(), release.clone());
            Arc::new(move |_: &mut dyn Any| -> Result<u32> {
                running.fetch_add(1, Ordering::AcqRel);
                while !release.load(Ordering::Acquire) {
                    thread::yield_now();
                }
                running.fetch_sub(1, Ordering::AcqRel);
                Ok(42)
            })
        };
        let link = Link::attach(&registrar, provider.attach_type(), ExtensionData::empty(), prog)?;
        let client = provider.get_attached_client().unwrap();

        let invokers: Vec<_> = (0..INFLIGHT)
            .map(|_| {
                let provider = provider.clone();
                thread::spawn(move || {
                    let _level = level::raise_to_dispatch();
                    invoke_first_attached(&provider, ExecutionLevel::Dispatch, &mut ())
                })
            })
            .collect();
        while running.load(Ordering::Acquire) != INFLIGHT {
            thread::yield_now();
        }

        let detacher = thread::spawn(move || link.detach());
        while client.rundown().is_active() {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(50));
        assert!(!detacher.is_finished());
        assert!(detach_notified.load(Ordering::Acquire));
        assert!(!client.enter_rundown(ExecutionLevel::Dispatch));

        release.store(true, Ordering::Release);
        for invoker in invokers {
            assert_eq!(invoker.join().unwrap(), Ok(InvokeOutcome::Invoked(42)));
        }
        detacher.join().unwrap()?;

        assert_eq!(running.load(Ordering::Acquire), 0);
        assert!(client.rundown().is_drained());
        assert!(!client.enter_rundown(ExecutionLevel::Dispatch));
        assert_eq!(provider.client_count(), 0);

        provider.unregister()?;
        Ok(())
    }

    #[test]
    #[should_panic(expected = "unregistered with 1 attached client(s)")]
    fn unregister_with_clients() {
        let registrar = Registrar::new();
        let provider =
            HookProvider::register(&registrar, params(ExecutionLevel::Passive), AcceptAll).unwrap();
        let _link = Link::attach(
            &registrar,
            provider.attach_type(),
            ExtensionData::empty(),
            program(0),
        )
        .unwrap();

        let _ = provider.unregister();
    }

    #[test]
    fn insertion_failure_undoes_attach() -> anyhow::Result<()> {
        let registrar = Registrar::new();
        let undone = Arc::new(AtomicBool::new(false));
        let module = {
            let undone = undone.clone();
            FnHookModule::new(
                |_: &HookClient| Ok(()),
                move |_: &HookClient| undone.store(true, Ordering::SeqCst),
            )
        };
        let provider = HookProvider::register(&registrar, params(ExecutionLevel::Dispatch), module)?;

        let client = HookClient::new(
            crate::registrar::BindingId::test(9),
            Uuid::new_v4(),
            provider.attach_type(),
            ExtensionData::empty(),
            program(0),
            ExecutionLevel::Dispatch,
        );
        let failed = Vec::<u8>::new().try_reserve(usize::MAX);
        assert!(failed.is_err());

        assert_eq!(
            provider.finish_attach(&client, failed),
            Err(HookError::NoMemory)
        );
        assert!(undone.load(Ordering::SeqCst));
        assert_eq!(provider.client_count(), 0);
        assert_eq!(provider.stats(), ProviderStats::default());

        provider.unregister()?;
        Ok(())
    }
}
