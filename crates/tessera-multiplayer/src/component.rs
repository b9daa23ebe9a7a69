//! Capability components attached to network views.
//!
//! A component is a named bundle of state plus the RPCs and entity messages
//! it answers to. Handlers are registered explicitly when the component is
//! built; the controller looks them up by RPC name and argument signature or
//! by message type id.

use std::any::Any;
use std::marker::PhantomData;

use rustc_hash::FxHashMap;

use crate::context::HandlerContext;
use crate::message::{EntityMessage, HandlerError, decode_body};
use crate::rpc::{RpcType, RpcValue, matches_signature};

/// Lifecycle of a component, driven by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Uninitialized,
    Initialized,
    Started,
    Destroyed,
}

type RpcFn = Box<dyn FnMut(&mut dyn Any, &mut HandlerContext<'_>, &[RpcValue]) -> Result<(), HandlerError>>;
type MessageFn = Box<dyn FnMut(&mut dyn Any, &mut HandlerContext<'_>, &[u8]) -> Result<(), HandlerError>>;
type HookFn = Box<dyn FnMut(&mut dyn Any, &mut HandlerContext<'_>) -> Result<(), HandlerError>>;

struct RpcEntry {
    signature: Vec<RpcType>,
    handler: RpcFn,
}

#[derive(Default)]
struct Hooks {
    initialize: Option<HookFn>,
    start: Option<HookFn>,
    destroy: Option<HookFn>,
}

/// A component attached to a [`NetworkView`](crate::view::NetworkView).
pub struct Component {
    name: String,
    state: ComponentState,
    data: Box<dyn Any>,
    rpcs: FxHashMap<String, Vec<RpcEntry>>,
    messages: FxHashMap<u16, MessageFn>,
    hooks: Hooks,
}

impl Component {
    /// Start building a stateless component.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(name: impl Into<String>) -> ComponentBuilder<()> {
        Self::with_state(name, ())
    }

    /// Start building a component that owns `state`. Handlers receive it
    /// mutably.
    pub fn with_state<S: 'static>(name: impl Into<String>, state: S) -> ComponentBuilder<S> {
        ComponentBuilder {
            component: Component {
                name: name.into(),
                state: ComponentState::Uninitialized,
                data: Box::new(state),
                rpcs: FxHashMap::default(),
                messages: FxHashMap::default(),
                hooks: Hooks::default(),
            },
            _state: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    /// The component's state, if it has type `S`.
    pub fn data<S: 'static>(&self) -> Option<&S> {
        self.data.downcast_ref()
    }

    pub fn data_mut<S: 'static>(&mut self) -> Option<&mut S> {
        self.data.downcast_mut()
    }

    pub fn has_rpc(&self, method: &str, args: &[RpcValue]) -> bool {
        self.rpcs
            .get(method)
            .is_some_and(|entries| entries.iter().any(|e| matches_signature(&e.signature, args)))
    }

    pub fn handles_message(&self, type_id: u16) -> bool {
        self.messages.contains_key(&type_id)
    }

    pub(crate) fn initialize(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        debug_assert_eq!(
            self.state,
            ComponentState::Uninitialized,
            "component {} initialised twice",
            self.name
        );
        self.state = ComponentState::Initialized;
        match self.hooks.initialize.as_mut() {
            Some(hook) => hook(self.data.as_mut(), ctx),
            None => Ok(()),
        }
    }

    pub(crate) fn start(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        debug_assert_eq!(self.state, ComponentState::Initialized);
        self.state = ComponentState::Started;
        match self.hooks.start.as_mut() {
            Some(hook) => hook(self.data.as_mut(), ctx),
            None => Ok(()),
        }
    }

    pub(crate) fn destroy(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), HandlerError> {
        let was_live = self.state != ComponentState::Uninitialized;
        self.state = ComponentState::Destroyed;
        match self.hooks.destroy.as_mut() {
            Some(hook) if was_live => hook(self.data.as_mut(), ctx),
            _ => Ok(()),
        }
    }

    /// Invoke the RPC matching `method` and the argument types. Returns
    /// `None` when this component has no such RPC.
    pub(crate) fn invoke_rpc(
        &mut self,
        method: &str,
        args: &[RpcValue],
        ctx: &mut HandlerContext<'_>,
    ) -> Option<Result<(), HandlerError>> {
        let entry = self
            .rpcs
            .get_mut(method)?
            .iter_mut()
            .find(|entry| matches_signature(&entry.signature, args))?;
        Some((entry.handler)(self.data.as_mut(), ctx, args))
    }

    pub(crate) fn invoke_message(
        &mut self,
        type_id: u16,
        body: &[u8],
        ctx: &mut HandlerContext<'_>,
    ) -> Option<Result<(), HandlerError>> {
        let handler = self.messages.get_mut(&type_id)?;
        Some(handler(self.data.as_mut(), ctx, body))
    }
}

/// Typed builder for a [`Component`] whose state is `S`.
pub struct ComponentBuilder<S> {
    component: Component,
    _state: PhantomData<fn(S)>,
}

impl<S: 'static> ComponentBuilder<S> {
    /// Answer RPC `method` when called with exactly `signature`.
    pub fn with_rpc<F>(mut self, method: &str, signature: &[RpcType], mut handler: F) -> Self
    where
        F: FnMut(&mut S, &mut HandlerContext<'_>, &[RpcValue]) -> Result<(), HandlerError> + 'static,
    {
        let erased: RpcFn = Box::new(move |data, ctx, args| handler(downcast(data), ctx, args));
        self.component
            .rpcs
            .entry(method.to_owned())
            .or_default()
            .push(RpcEntry {
                signature: signature.to_vec(),
                handler: erased,
            });
        self
    }

    /// Handle entity message `M`.
    pub fn with_message<M, F>(mut self, mut handler: F) -> Self
    where
        M: EntityMessage,
        F: FnMut(&mut S, &mut HandlerContext<'_>, M) -> Result<(), HandlerError> + 'static,
    {
        let erased: MessageFn = Box::new(move |data, ctx, body| {
            let message = decode_body::<M>(M::NAME, body)?;
            handler(downcast(data), ctx, message)
        });
        let previous = self.component.messages.insert(M::TYPE_ID, erased);
        debug_assert!(
            previous.is_none(),
            "component {} handles {} twice",
            self.component.name,
            M::NAME
        );
        self
    }

    pub fn on_initialize<F>(mut self, mut hook: F) -> Self
    where
        F: FnMut(&mut S, &mut HandlerContext<'_>) -> Result<(), HandlerError> + 'static,
    {
        self.component.hooks.initialize = Some(Box::new(move |data, ctx| hook(downcast(data), ctx)));
        self
    }

    pub fn on_start<F>(mut self, mut hook: F) -> Self
    where
        F: FnMut(&mut S, &mut HandlerContext<'_>) -> Result<(), HandlerError> + 'static,
    {
        self.component.hooks.start = Some(Box::new(move |data, ctx| hook(downcast(data), ctx)));
        self
    }

    pub fn on_destroy<F>(mut self, mut hook: F) -> Self
    where
        F: FnMut(&mut S, &mut HandlerContext<'_>) -> Result<(), HandlerError> + 'static,
    {
        self.component.hooks.destroy = Some(Box::new(move |data, ctx| hook(downcast(data), ctx)));
        self
    }

    pub fn build(self) -> Component {
        self.component
    }
}

impl<S: 'static> From<ComponentBuilder<S>> for Component {
    fn from(builder: ComponentBuilder<S>) -> Self {
        builder.build()
    }
}

/// The builder guarantees the boxed state is an `S`.
fn downcast<S: 'static>(data: &mut dyn Any) -> &mut S {
    match data.downcast_mut::<S>() {
        Some(state) => state,
        None => unreachable!("component state type is fixed by its builder"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Command;
    use crate::network_id::NetworkId;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Add(i32);

    impl EntityMessage for Add {
        const TYPE_ID: u16 = 3;
        const NAME: &'static str = "Add";
    }

    fn with_context<T>(f: impl FnOnce(&mut HandlerContext<'_>) -> T) -> T {
        let mut outbox: Vec<Command> = Vec::new();
        let mut ctx = HandlerContext {
            source: None,
            source_peer_id: None,
            view: NetworkId::ROOT,
            local_peer_id: None,
            request_id: None,
            outbox: &mut outbox,
        };
        f(&mut ctx)
    }

    fn counter() -> Component {
        Component::with_state("Counter", 0i32)
            .with_rpc("Set", &[RpcType::I32], |total, _, args| {
                *total = args[0].as_i32().unwrap_or_default();
                Ok(())
            })
            .with_rpc("Set", &[RpcType::String], |total, _, args| {
                *total = args[0].as_str().map_or(0, str::len) as i32;
                Ok(())
            })
            .with_message::<Add, _>(|total, _, Add(n)| {
                *total += n;
                Ok(())
            })
            .build()
    }

    #[test]
    fn test_rpc_overloads_by_signature() {
        let mut component = counter();
        with_context(|ctx| {
            component
                .invoke_rpc("Set", &[RpcValue::I32(7)], ctx)
                .unwrap()
                .unwrap();
            assert_eq!(component.data::<i32>(), Some(&7));

            component
                .invoke_rpc("Set", &[RpcValue::from("abc")], ctx)
                .unwrap()
                .unwrap();
            assert_eq!(component.data::<i32>(), Some(&3));

            assert!(component.invoke_rpc("Set", &[RpcValue::Bool(true)], ctx).is_none());
            assert!(component.invoke_rpc("Missing", &[], ctx).is_none());
        });
    }

    #[test]
    fn test_message_handler_decodes_body() {
        let mut component = counter();
        let body = postcard::to_allocvec(&Add(5)).unwrap();
        with_context(|ctx| {
            component.invoke_message(Add::TYPE_ID, &body, ctx).unwrap().unwrap();
            component.invoke_message(Add::TYPE_ID, &body, ctx).unwrap().unwrap();
            assert!(component.invoke_message(99, &body, ctx).is_none());
            assert!(matches!(
                component.invoke_message(Add::TYPE_ID, &[], ctx),
                Some(Err(HandlerError::Decode { name: "Add", .. }))
            ));
        });
        assert_eq!(component.data::<i32>(), Some(&10));
        assert!(component.handles_message(Add::TYPE_ID));
    }

    #[test]
    fn test_lifecycle_hooks_run_in_order() {
        let mut component: Component = Component::with_state("Hooks", Vec::<&str>::new())
            .on_initialize(|log, _| {
                log.push("init");
                Ok(())
            })
            .on_start(|log, _| {
                log.push("start");
                Ok(())
            })
            .on_destroy(|log, _| {
                log.push("destroy");
                Ok(())
            })
            .into();

        assert_eq!(component.state(), ComponentState::Uninitialized);
        with_context(|ctx| {
            component.initialize(ctx).unwrap();
            component.start(ctx).unwrap();
            component.destroy(ctx).unwrap();
        });
        assert_eq!(component.state(), ComponentState::Destroyed);
        assert_eq!(
            component.data::<Vec<&str>>().unwrap(),
            &vec!["init", "start", "destroy"]
        );
    }

    #[test]
    fn test_destroying_unstarted_component_skips_hook() {
        let mut component: Component = Component::with_state("Hooks", 0u8)
            .on_destroy(|calls, _| {
                *calls += 1;
                Ok(())
            })
            .into();
        with_context(|ctx| component.destroy(ctx).unwrap());
        assert_eq!(component.data::<u8>(), Some(&0));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "initialised twice")]
    fn test_double_initialise_asserts() {
        let mut component = Component::new("Once").build();
        with_context(|ctx| {
            component.initialize(ctx).unwrap();
            component.initialize(ctx).unwrap();
        });
    }

    #[test]
    fn test_wrong_state_type_is_none() {
        let component = counter();
        assert!(component.data::<String>().is_none());
        assert!(component.has_rpc("Set", &[RpcValue::I32(1)]));
        assert!(component.handles_message(Add::TYPE_ID));
    }
}
