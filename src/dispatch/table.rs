//! Registration side of interception: address-keyed hook chains.

use std::collections::HashMap;

use crate::{
    abi::{CallingConvention, ParamSpec},
    cpu::GuestAddress,
    dispatch::hook::{CallFn, EnterFn, ExitFn},
    symbols::{SymbolName, SymbolTable},
    Result,
};

/// Hooks registered on one intercepted address.
///
/// At most one Enter and one Call; any number of Exit hooks, invoked in
/// registration order. A chain with no Call hook falls back to the engine's
/// default behavior (return zero).
#[derive(Clone, Default)]
struct HookChain {
    spec: ParamSpec,
    convention: Option<CallingConvention>,
    enter: Option<EnterFn>,
    call: Option<CallFn>,
    exits: Vec<ExitFn>,
}

/// An immutable copy of one chain, taken at dispatch time.
///
/// The engine dispatches against a snapshot so hooks are free to mutate the
/// live table mid-dispatch (register more hooks, replace themselves) without
/// aliasing the chain being run. Callback handles are shared, not cloned.
#[derive(Clone)]
pub struct ChainSnapshot {
    pub(crate) spec: ParamSpec,
    pub(crate) convention: Option<CallingConvention>,
    pub(crate) enter: Option<EnterFn>,
    pub(crate) call: Option<CallFn>,
    pub(crate) exits: Vec<ExitFn>,
}

/// Session-level map from guest address to hook chain.
///
/// Symbol-keyed registration resolves through the [`SymbolTable`] exactly
/// once, at registration time; dispatch never touches symbol names.
#[derive(Default)]
pub struct InterceptionTable {
    chains: HashMap<GuestAddress, HookChain>,
}

impl InterceptionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the parameter spec intercepts at `address` resolve with.
    ///
    /// Plain address hooks (watchpoints on arbitrary code) leave the spec
    /// empty and resolve nothing.
    pub fn declare(&mut self, address: GuestAddress, spec: ParamSpec) {
        self.chains.entry(address).or_default().spec = spec;
    }

    /// Resolves `symbol` and declares its spec, returning the address the
    /// chain is keyed by.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::UnresolvedSymbol`](crate::Error::UnresolvedSymbol)
    /// if no loaded image exports the name. Surfaced here, at registration,
    /// never deferred to dispatch.
    pub fn declare_symbol(
        &mut self,
        symbols: &SymbolTable,
        symbol: &SymbolName,
        spec: ParamSpec,
    ) -> Result<GuestAddress> {
        let address = symbols.resolve(symbol)?;
        self.declare(address, spec);
        Ok(address)
    }

    /// Overrides the calling convention for `address`.
    ///
    /// Chains without an override resolve with the session default. A
    /// misdeclared convention is undetectable; the resolved values are then
    /// garbage, which is documented behavior rather than an error.
    pub fn override_convention(&mut self, address: GuestAddress, convention: CallingConvention) {
        self.chains.entry(address).or_default().convention = Some(convention);
    }

    /// Installs the Enter hook for `address`, replacing any existing one.
    pub fn set_enter(&mut self, address: GuestAddress, hook: EnterFn) {
        self.chains.entry(address).or_default().enter = Some(hook);
    }

    /// Installs the Call hook for `address`, replacing any existing one.
    pub fn set_call(&mut self, address: GuestAddress, hook: CallFn) {
        self.chains.entry(address).or_default().call = Some(hook);
    }

    /// Appends an Exit hook for `address`; invocation preserves registration
    /// order.
    pub fn push_exit(&mut self, address: GuestAddress, hook: ExitFn) {
        self.chains.entry(address).or_default().exits.push(hook);
    }

    /// Removes every hook at `address`.
    pub fn clear(&mut self, address: GuestAddress) {
        self.chains.remove(&address);
    }

    /// Returns `true` if any chain is registered at `address`.
    #[must_use]
    pub fn is_hooked(&self, address: GuestAddress) -> bool {
        self.chains.contains_key(&address)
    }

    /// Number of addresses with a registered chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    /// Returns `true` if no chain is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Takes the dispatch-time copy of the chain at `address`.
    #[must_use]
    pub(crate) fn snapshot(&self, address: GuestAddress) -> Option<ChainSnapshot> {
        self.chains.get(&address).map(|chain| ChainSnapshot {
            spec: chain.spec.clone(),
            convention: chain.convention,
            enter: chain.enter.clone(),
            call: chain.call.clone(),
            exits: chain.exits.clone(),
        })
    }
}

impl std::fmt::Debug for InterceptionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionTable")
            .field("chains", &self.chains.len())
            .finish()
    }
}
