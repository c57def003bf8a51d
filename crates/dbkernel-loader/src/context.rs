//! Isolated loading contexts.
//!
//! Every package gets its own [`LoadingContext`] with its own symbol table,
//! parented to the host context. Lookups go to the parent first, so symbols
//! the host exports are shared, while a package's private dependencies stay
//! invisible to every other package. Two packages can therefore each carry a
//! different version of the same library.
//!
//! Code invoked through a [`ContextShim`](crate::ContextShim) runs with its
//! originating context installed as the thread's *current* context, which is
//! what [`LoadingContext::resolve_current`] consults.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dbkernel_core::HostExport;

use crate::package::{OpenedPackage, UnitDescriptor};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<LoadingContext>>> = const { RefCell::new(None) };
}

/// Process-unique identity of a loading context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// A symbol found through a context lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub name: String,
    pub version: String,
    /// Context whose table provided the symbol.
    pub origin: ContextId,
}

/// Symbol-resolution scope for one package (or for the host).
pub struct LoadingContext {
    id: ContextId,
    package: Option<PathBuf>,
    parent: Option<Arc<LoadingContext>>,
    symbols: HashMap<String, String>,
    closed: AtomicBool,
    // Units hold code from `library`; they must drop before it.
    units: Vec<UnitDescriptor>,
    library: Option<libloading::Library>,
}

impl LoadingContext {
    /// Create the root context holding the symbols the host exports.
    pub fn host(exports: &[HostExport]) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::next(),
            package: None,
            parent: None,
            symbols: exports
                .iter()
                .map(|e| (e.name.clone(), e.version.clone()))
                .collect(),
            closed: AtomicBool::new(false),
            units: Vec::new(),
            library: None,
        })
    }

    /// Create a context for an opened package.
    pub(crate) fn for_package(path: PathBuf, parent: Arc<LoadingContext>, opened: OpenedPackage) -> Arc<Self> {
        let OpenedPackage { export, library } = opened;
        let (symbols, units) = export.into_parts();
        let ctx = Arc::new(Self {
            id: ContextId::next(),
            package: Some(path),
            parent: Some(parent),
            symbols: symbols.into_iter().map(|s| (s.name, s.version)).collect(),
            closed: AtomicBool::new(false),
            units,
            library,
        });
        tracing::debug!(
            context = %ctx.id,
            package = ?ctx.package,
            units = ctx.units.len(),
            native = ctx.library.is_some(),
            "created loading context"
        );
        ctx
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Package this context was created for (`None` for the host).
    pub fn package_path(&self) -> Option<&Path> {
        self.package.as_deref()
    }

    pub fn parent(&self) -> Option<&Arc<LoadingContext>> {
        self.parent.as_ref()
    }

    /// Units the package declares.
    pub fn units(&self) -> &[UnitDescriptor] {
        &self.units
    }

    /// Find a unit by name.
    pub fn unit(&self, name: &str) -> Option<&UnitDescriptor> {
        self.units.iter().find(|u| u.name() == name)
    }

    /// Check whether this context wraps a native library.
    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }

    /// Resolve `name`, parent first.
    ///
    /// A closed context no longer resolves its own symbols, but its parent
    /// chain still does.
    pub fn resolve(&self, name: &str) -> Option<ResolvedSymbol> {
        if let Some(found) = self.parent.as_ref().and_then(|p| p.resolve(name)) {
            return Some(found);
        }
        if self.is_closed() {
            return None;
        }
        self.symbols.get(name).map(|version| ResolvedSymbol {
            name: name.to_string(),
            version: version.clone(),
            origin: self.id,
        })
    }

    /// Names of the symbols this context itself exports.
    pub fn own_symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    /// Mark the context closed. Live instances keep working; no new units
    /// can be instantiated from it.
    pub fn close(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        if was_open {
            tracing::debug!(context = %self.id, package = ?self.package, "closed loading context");
        }
        was_open
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Install this context as the thread's current context until the guard
    /// drops.
    pub fn enter(self: &Arc<Self>) -> ContextGuard {
        let previous = CURRENT.with(|c| c.replace(Some(self.clone())));
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// The context installed on this thread, if any.
    pub fn current() -> Option<Arc<LoadingContext>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Resolve `name` through the thread's current context.
    pub fn resolve_current(name: &str) -> Option<ResolvedSymbol> {
        Self::current().and_then(|ctx| ctx.resolve(name))
    }
}

impl std::fmt::Debug for LoadingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingContext")
            .field("id", &self.id)
            .field("package", &self.package)
            .field("symbols", &self.symbols.len())
            .field("units", &self.units.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Restores the previous current context when dropped.
#[must_use = "the context is only current while the guard is alive"]
pub struct ContextGuard {
    previous: Option<Arc<LoadingContext>>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}
