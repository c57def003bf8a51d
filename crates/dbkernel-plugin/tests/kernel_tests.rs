use std::sync::Arc;
use std::time::Duration;

use dbkernel_core::{
    Event, EventBus, EventSink, HostConfig, ModuleRegistry, NullSink, Plugin, PluginError,
    PluginResult, RunContext,
};
use dbkernel_loader::WorkerPool;
use dbkernel_plugin::{
    DependencyProvider, Microkernel, Module, ModuleDefinition, ModuleInstance, ModuleState,
    ProvidedFactory,
};
use parking_lot::Mutex;

type Log = Arc<Mutex<Vec<String>>>;

/// Plugin module that records its lifecycle calls.
struct Recorder {
    id: &'static str,
    log: Log,
    fail_start: bool,
    block_until_cancelled: bool,
}

impl Recorder {
    fn new(id: &'static str, log: &Log) -> Self {
        Self {
            id,
            log: log.clone(),
            fail_start: false,
            block_until_cancelled: false,
        }
    }
}

impl Plugin for Recorder {
    fn start(&self, ctx: &RunContext) -> PluginResult<()> {
        self.log.lock().push(format!("start:{}", self.id));
        if self.fail_start {
            return Err(PluginError::failed("refusing to start"));
        }
        while self.block_until_cancelled && !ctx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn stop(&self) -> PluginResult<()> {
        self.log.lock().push(format!("stop:{}", self.id));
        Ok(())
    }
}

impl Module for Recorder {
    fn as_plugin(&self) -> Option<&dyn Plugin> {
        Some(self)
    }
}

/// Module with no lifecycle, only startup hooks.
struct Settings {
    log: Log,
}

impl Module for Settings {
    fn startup_hooks(&self) -> &[&'static str] {
        &["warm_cache", "explode"]
    }

    fn invoke_startup(&self, hook: &str) -> PluginResult<()> {
        if hook == "explode" {
            panic!("hook blew up");
        }
        self.log.lock().push(format!("hook:{hook}"));
        Ok(())
    }
}

fn recorder(id: &'static str, log: &Log) -> ModuleDefinition {
    let log = log.clone();
    ModuleDefinition::new(id, move |_| Ok(ModuleInstance::new(Recorder::new(id, &log))))
}

fn kernel_with(events: Arc<dyn EventSink>) -> Microkernel {
    let config = HostConfig::builder()
        .start_timeout_ms(2_000u64)
        .stop_timeout_ms(1_000u64)
        .build()
        .unwrap();
    Microkernel::new(
        &config,
        Arc::new(ModuleRegistry::new()),
        WorkerPool::current(),
        events,
    )
}

fn kernel() -> Microkernel {
    kernel_with(Arc::new(NullSink))
}

fn position(order: &[String], id: &str) -> usize {
    order.iter().position(|n| n == id).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_initialization_order_respects_dependencies() {
    let log = Log::default();
    let kernel = kernel();
    kernel.initialize(
        [
            recorder("reports", &log).depends_on("app"),
            recorder("app", &log).depends_on("db").depends_on("cache"),
            recorder("cache", &log).depends_on("db"),
            recorder("db", &log),
        ],
        [],
    );

    let order = kernel.initialization_order();
    assert_eq!(order.len(), 4);
    assert!(position(&order, "db") < position(&order, "cache"));
    assert!(position(&order, "cache") < position(&order, "app"));
    assert!(position(&order, "app") < position(&order, "reports"));
    assert_eq!(kernel.state("db"), ModuleState::Registered);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dependencies_are_injected_from_registry() {
    struct Db {
        url: String,
    }
    impl Module for Db {}

    struct Repo {
        db_url: Option<String>,
        has_metrics: bool,
    }
    impl Module for Repo {}

    let kernel = kernel();
    kernel.initialize(
        [
            ModuleDefinition::new("repo", |deps| {
                Ok(ModuleInstance::new(Repo {
                    db_url: deps.get_as::<Db>("db").map(|db| db.url.clone()),
                    has_metrics: deps.get("metrics").is_some(),
                }))
            })
            .depends_on("db")
            .depends_on("metrics"),
            ModuleDefinition::new("db", |_| {
                Ok(ModuleInstance::new(Db {
                    url: "postgres://local".into(),
                }))
            }),
        ],
        [],
    );

    let report = kernel.start_all_plugins().await;
    assert!(report.is_success());
    assert_eq!(report.order, vec!["db", "repo"]);

    let repo = kernel.registry().get_as::<Repo>("repo").unwrap();
    assert_eq!(repo.db_url.as_deref(), Some("postgres://local"));
    assert!(!repo.has_metrics);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_provider_instances_satisfy_dependencies() {
    struct Pool {
        size: usize,
    }

    struct PoolProvider {
        closed: Arc<Mutex<bool>>,
    }

    impl DependencyProvider for PoolProvider {
        fn name(&self) -> &str {
            "pools"
        }

        fn factories(&self) -> Vec<ProvidedFactory> {
            vec![
                ProvidedFactory::value("pool", Pool { size: 8 }),
                ProvidedFactory::new("broken", || Err(PluginError::failed("no config"))),
            ]
        }

        fn close(&self) -> PluginResult<()> {
            *self.closed.lock() = true;
            Ok(())
        }
    }

    struct Consumer {
        pool_size: usize,
    }
    impl Module for Consumer {}

    let closed = Arc::new(Mutex::new(false));
    let kernel = kernel();
    let provided = kernel.initialize(
        [ModuleDefinition::new("consumer", |deps| {
            let size = deps.get_as::<Pool>("pool").map_or(0, |p| p.size);
            Ok(ModuleInstance::new(Consumer { pool_size: size }))
        })
        .depends_on("pool")],
        [Arc::new(PoolProvider {
            closed: closed.clone(),
        }) as Arc<dyn DependencyProvider>],
    );
    assert_eq!(provided, 1);
    assert_eq!(kernel.initialization_order(), vec!["consumer"]);

    kernel.start_all_plugins().await;
    assert_eq!(kernel.registry().get_as::<Consumer>("consumer").unwrap().pool_size, 8);

    kernel.shutdown().await;
    assert!(*closed.lock());
    assert!(kernel.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cyclic_dependencies_still_start_everything() {
    let log = Log::default();
    let kernel = kernel();
    kernel.initialize(
        [
            recorder("a", &log).depends_on("b"),
            recorder("b", &log).depends_on("a"),
            recorder("c", &log),
        ],
        [],
    );

    let report = kernel.start_all_plugins().await;
    let mut order = report.order.clone();
    order.sort();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert_eq!(report.started.len(), 3);
    for id in ["a", "b", "c"] {
        assert_eq!(kernel.state(id), ModuleState::Started);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_all_is_reverse_of_start_order() {
    let log = Log::default();
    let kernel = kernel();
    kernel.initialize(
        [
            recorder("ui", &log).depends_on("service"),
            recorder("service", &log).depends_on("store"),
            recorder("store", &log),
        ],
        [],
    );

    let report = kernel.start_all_plugins().await;
    assert_eq!(report.order, vec!["store", "service", "ui"]);
    assert_eq!(kernel.last_start_order(), report.order);

    let stopped = kernel.stop_all_plugins();
    let mut expected = report.order.clone();
    expected.reverse();
    assert_eq!(stopped, expected);

    let stops: Vec<String> = log
        .lock()
        .iter()
        .filter(|e| e.starts_with("stop:"))
        .cloned()
        .collect();
    assert_eq!(stops, vec!["stop:ui", "stop:service", "stop:store"]);

    for id in ["ui", "service", "store"] {
        assert_eq!(kernel.state(id), ModuleState::Stopped);
        assert!(!kernel.registry().contains(id));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_start_does_not_block_dependents() {
    let log = Log::default();
    let bus = Arc::new(EventBus::new());
    let errors = Log::default();
    let sink = errors.clone();
    bus.subscribe("plugin_error", move |event| {
        if let Event::PluginError { id, .. } = event {
            sink.lock().push(id.clone());
        }
    });

    let kernel = kernel_with(bus);
    let a_log = log.clone();
    kernel.initialize(
        [
            recorder("b", &log).depends_on("a"),
            ModuleDefinition::new("a", move |_| {
                Ok(ModuleInstance::new(Recorder {
                    fail_start: true,
                    ..Recorder::new("a", &a_log)
                }))
            }),
        ],
        [],
    );

    let report = kernel.start_all_plugins().await;
    assert_eq!(report.order, vec!["a", "b"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "a");
    assert_eq!(report.started, vec!["b"]);

    assert_eq!(kernel.state("a"), ModuleState::Failed);
    assert_eq!(kernel.state("b"), ModuleState::Started);
    assert_eq!(*errors.lock(), vec!["a"]);

    let starts: Vec<String> = log.lock().iter().filter(|e| e.starts_with("start:")).cloned().collect();
    assert!(starts.contains(&"start:a".to_string()));
    assert!(starts.contains(&"start:b".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_factory_marks_failed() {
    let log = Log::default();
    let kernel = kernel();
    kernel.initialize(
        [
            ModuleDefinition::new("bad", |_| -> PluginResult<ModuleInstance> {
                panic!("constructor crashed")
            }),
            recorder("good", &log),
        ],
        [],
    );

    let report = kernel.start_all_plugins().await;
    assert_eq!(kernel.state("bad"), ModuleState::Failed);
    assert_eq!(kernel.state("good"), ModuleState::Started);
    assert!(report.failed[0].1.contains("constructor crashed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_startup_hooks_run_best_effort() {
    let log = Log::default();
    let hook_log = log.clone();
    let kernel = kernel();
    kernel.initialize(
        [ModuleDefinition::new("settings", move |_| {
            Ok(ModuleInstance::new(Settings {
                log: hook_log.clone(),
            }))
        })],
        [],
    );

    let report = kernel.start_all_plugins().await;
    assert!(report.is_success());
    assert_eq!(*log.lock(), vec!["hook:warm_cache"]);
    assert_eq!(kernel.state("settings"), ModuleState::Started);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_long_running_start_is_pending_then_stops() {
    let log = Log::default();
    let run_log = log.clone();
    let config = HostConfig::builder()
        .start_timeout_ms(100u64)
        .stop_timeout_ms(1_000u64)
        .build()
        .unwrap();
    let kernel = Microkernel::new(
        &config,
        Arc::new(ModuleRegistry::new()),
        WorkerPool::current(),
        Arc::new(NullSink),
    );
    kernel.initialize(
        [ModuleDefinition::new("server", move |_| {
            Ok(ModuleInstance::new(Recorder {
                block_until_cancelled: true,
                ..Recorder::new("server", &run_log)
            }))
        })],
        [],
    );

    let report = kernel.start_all_plugins().await;
    assert_eq!(report.pending, vec!["server"]);
    assert_eq!(kernel.state("server"), ModuleState::Started);

    assert!(kernel.stop_plugin("server"));
    assert_eq!(kernel.state("server"), ModuleState::Stopped);
    assert!(!kernel.stop_plugin("server"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_plugin_is_idempotent() {
    let log = Log::default();
    let kernel = kernel();
    kernel.initialize([recorder("solo", &log)], []);

    assert_eq!(kernel.start_plugin("solo").await.unwrap(), ModuleState::Started);
    assert_eq!(kernel.start_plugin("solo").await.unwrap(), ModuleState::Started);
    assert_eq!(log.lock().iter().filter(|e| *e == "start:solo").count(), 1);
    assert!(kernel.start_plugin("ghost").await.is_err());
}

fn looping(id: &'static str, log: &Log) -> ModuleDefinition {
    let log = log.clone();
    ModuleDefinition::new(id, move |_| {
        Ok(ModuleInstance::new(Recorder {
            block_until_cancelled: true,
            ..Recorder::new(id, &log)
        }))
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_all_includes_individually_started_modules() {
    let log = Log::default();
    let kernel = kernel();
    kernel.initialize([looping("solo", &log)], []);

    assert_eq!(kernel.start_plugin("solo").await.unwrap(), ModuleState::Started);
    assert_eq!(kernel.last_start_order(), vec!["solo"]);

    assert_eq!(kernel.stop_all_plugins(), vec!["solo"]);
    assert_eq!(kernel.state("solo"), ModuleState::Stopped);
    assert!(!kernel.registry().contains("solo"));
    assert!(log.lock().contains(&"stop:solo".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_stops_modules_outside_the_start_order() {
    let log = Log::default();
    let kernel = kernel();
    kernel.initialize([recorder("first", &log), looping("late", &log)], []);

    kernel.start_all_plugins().await;
    kernel.initialize([looping("extra", &log)], []);
    kernel.start_plugin("extra").await.unwrap();

    kernel.shutdown().await;

    let stops: Vec<String> = log.lock().iter().filter(|e| e.starts_with("stop:")).cloned().collect();
    assert_eq!(stops, vec!["stop:extra", "stop:late", "stop:first"]);
    assert!(kernel.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_keeps_failed_state() {
    let log = Log::default();
    let a_log = log.clone();
    let kernel = kernel();
    kernel.initialize(
        [
            recorder("b", &log).depends_on("a"),
            ModuleDefinition::new("a", move |_| {
                Ok(ModuleInstance::new(Recorder {
                    fail_start: true,
                    ..Recorder::new("a", &a_log)
                }))
            }),
        ],
        [],
    );

    kernel.start_all_plugins().await;
    let stopped = kernel.stop_all_plugins();
    assert_eq!(stopped, vec!["b", "a"]);

    assert_eq!(kernel.state("a"), ModuleState::Failed);
    assert_eq!(kernel.state("b"), ModuleState::Stopped);
}
