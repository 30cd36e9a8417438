//! The emulation session: shared state, loading, configuration, tracing.
//!
//! A [`Session`] owns everything one emulated process shares across
//! dispatches (the guest memory view, the thread manager, the symbol table,
//! the pluggable export cache and the trace channel) and is the handle every
//! hook callback receives. One session is fully independent of any other;
//! isolation between guests is achieved by running sessions in separate host
//! processes, never by sharing.
//!
//! # Library loading
//!
//! [`Session::load_library`] is the cached loading path: it consults the
//! [`SymbolCache`] first and only falls back to the external container parser
//! on a miss, then stores and *pins* the entry. Pinning gives the session
//! scoped immutability the cache contract requires: once an entry has been
//! handed out for a path, every later lookup in this session sees the same
//! export set even if the file changes on disk mid-session.

mod config;
mod trace;

pub use config::{SchedulingPolicy, SessionConfig};
pub use trace::{BufferSink, NullSink, TraceEvent, TraceSink};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{
    cache::{CacheEntry, DiskCache, Fingerprint, MemoryCache, SymbolCache},
    cpu::{CpuCore, GuestAddress},
    memory::MemoryView,
    symbols::{ImageExports, SymbolName, SymbolTable},
    thread::{ThreadId, ThreadManager},
    Result,
};

/// Shared state of one emulation run.
pub struct Session {
    config: SessionConfig,
    memory: MemoryView,
    threads: ThreadManager,
    symbols: SymbolTable,
    cache: Box<dyn SymbolCache>,
    /// First entry handed out per path; session-scoped immutability.
    pinned: HashMap<PathBuf, CacheEntry>,
    trace_sink: Box<dyn TraceSink>,
    stop: bool,
}

impl Session {
    /// Creates a session with an in-memory cache and the default trace sink.
    ///
    /// Production drivers normally substitute the persisted cache via
    /// [`with_cache`](Self::with_cache).
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let mut memory = MemoryView::new(config.pointer_width);
        memory.set_scan_window(config.scan_window);
        let threads = ThreadManager::new(config.thread_stack_area, config.thread_stack_size);
        Session {
            config,
            memory,
            threads,
            symbols: SymbolTable::new(),
            cache: Box::new(MemoryCache::new()),
            pinned: HashMap::new(),
            trace_sink: Box::<BufferSink>::default(),
            stop: false,
        }
    }

    /// Replaces the export cache implementation.
    #[must_use]
    pub fn with_cache(mut self, cache: Box<dyn SymbolCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Installs the persisted disk cache rooted at `dir`.
    ///
    /// [`SessionConfig::trust_stale_cache`] is applied to the cache: when
    /// set, persisted entries are accepted even if the image file changed
    /// since they were stored.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Image`](crate::Error::Image) if the cache
    /// directory cannot be created.
    pub fn with_disk_cache(self, dir: &Path) -> Result<Self> {
        let cache = DiskCache::open(dir)?.trust_stale(self.config.trust_stale_cache);
        Ok(self.with_cache(Box::new(cache)))
    }

    /// Replaces the trace sink.
    #[must_use]
    pub fn with_trace_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.trace_sink = sink;
        self
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The guest memory view.
    #[must_use]
    pub fn memory(&self) -> &MemoryView {
        &self.memory
    }

    /// The guest memory view, mutably.
    pub fn memory_mut(&mut self) -> &mut MemoryView {
        &mut self.memory
    }

    /// The thread manager.
    #[must_use]
    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    /// The symbol table.
    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Id of the guest thread currently loaded into the core.
    #[must_use]
    pub fn current_thread_id(&self) -> ThreadId {
        self.threads.current_id()
    }

    /// Adopts the core's state as the main thread. Call once, after loading.
    pub fn init_main_thread(&mut self, core: &dyn CpuCore) -> ThreadId {
        self.threads.init_main(core)
    }

    /// Spawns a guest thread with a fresh stack (see
    /// [`ThreadManager::spawn`]).
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Decode`](crate::Error::Decode) if the stack region
    /// cannot be mapped.
    pub fn spawn_thread(&mut self, entry: GuestAddress, argument: u64) -> Result<ThreadId> {
        self.threads.spawn(&mut self.memory, entry, argument)
    }

    /// Performs one cooperative context switch and traces it.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::SchedulingInvariant`](crate::Error::SchedulingInvariant)
    /// from the thread manager; the session is unusable afterwards.
    pub fn switch_threads(&mut self, core: &mut dyn CpuCore) -> Result<ThreadId> {
        let from = self.threads.current_id();
        let to = self.threads.switch(core)?;
        self.trace(TraceEvent::ContextSwitch { from, to });
        Ok(to)
    }

    /// Exits the current guest thread, releasing its stack region.
    ///
    /// A [`switch_threads`](Self::switch_threads) must follow before the core
    /// steps again.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::SchedulingInvariant`](crate::Error::SchedulingInvariant)
    /// if the current thread already exited.
    pub fn exit_current_thread(&mut self) -> Result<()> {
        self.threads.exit_current(&mut self.memory)
    }

    /// Registers an already-parsed image's exports without touching the cache.
    pub fn add_image(&mut self, exports: &ImageExports, base: GuestAddress) {
        self.symbols.add_image(&exports.library, &exports.exports, base);
    }

    /// Loads a library through the cache, falling back to `parse` on a miss.
    ///
    /// The entry describing the library's exports is pinned for the rest of
    /// the session and its symbols are registered at `base`. Corrupt or stale
    /// persisted entries surface as misses and are rebuilt; only a parser
    /// failure propagates.
    ///
    /// # Errors
    ///
    /// Fails with whatever `parse` reports, or
    /// [`Error::Image`](crate::Error::Image) if the file cannot be
    /// fingerprinted after a successful parse.
    pub fn load_library(
        &mut self,
        path: &Path,
        base: GuestAddress,
        parse: impl FnOnce(&Path) -> Result<ImageExports>,
    ) -> Result<CacheEntry> {
        if let Some(entry) = self.pinned.get(path) {
            return Ok(entry.clone());
        }

        if let Some(entry) = self.cache.lookup(path) {
            self.trace(TraceEvent::CacheHit {
                path: path.to_path_buf(),
            });
            self.register_entry(&entry, base);
            self.pinned.insert(path.to_path_buf(), entry.clone());
            return Ok(entry);
        }
        self.trace(TraceEvent::CacheMiss {
            path: path.to_path_buf(),
        });

        let parsed = parse(path)?;
        let fingerprint = Fingerprint::of(path)?;
        let entry = CacheEntry::new(
            &parsed.library,
            fingerprint,
            parsed.exports.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        );
        self.cache.store(path, &entry);
        self.trace(TraceEvent::CacheRebuilt {
            path: path.to_path_buf(),
        });
        self.register_entry(&entry, base);
        self.pinned.insert(path.to_path_buf(), entry.clone());
        Ok(entry)
    }

    /// Records the argument count observed at a variadic call site into the
    /// pinned entry for `path` and re-persists it.
    pub fn record_call_site(&mut self, path: &Path, call_site: GuestAddress, arg_count: u8) {
        if let Some(entry) = self.pinned.get_mut(path) {
            entry.record_call_site(call_site.value(), arg_count);
            self.cache.store(path, entry);
        }
    }

    /// Records a trace event.
    pub fn trace(&mut self, event: TraceEvent) {
        self.trace_sink.record(event);
    }

    /// Requests that the session stop at the next safe point.
    ///
    /// Observed by the dispatch engine immediately after the current hook
    /// chain completes, and by drivers after a context switch completes;
    /// never mid-instruction.
    pub fn request_stop(&mut self) {
        self.stop = true;
        self.trace(TraceEvent::StopRequested);
    }

    /// Returns `true` once a stop has been requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop
    }

    fn register_entry(&mut self, entry: &CacheEntry, base: GuestAddress) {
        for (name, offset) in &entry.exports {
            self.symbols.insert(
                SymbolName::new(&entry.library, name),
                base.wrapping_add(u64::from(*offset)),
            );
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("threads", &self.threads.contexts().len())
            .field("symbols", &self.symbols.len())
            .field("pinned", &self.pinned.len())
            .field("stop", &self.stop)
            .finish()
    }
}
