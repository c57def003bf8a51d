use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dbkernel_core::{
    Connection, ConnectionProperties, Driver, Event, EventBus, HostConfig, ModuleRegistry, Plugin,
    PluginDescriptor, PluginError, PluginResult, PluginStatus, RunContext,
};
use dbkernel_loader::{
    DriverRegistry, DynamicModuleLoader, InProcessOpener, PackageExport, UnitDescriptor,
    WorkerPool,
};
use dbkernel_plugin::{ManifestSource, PluginManager};
use parking_lot::Mutex;

type Log = Arc<Mutex<Vec<String>>>;

struct Service {
    id: &'static str,
    log: Log,
    fail_start: bool,
}

impl Plugin for Service {
    fn initialize(&self) -> PluginResult<()> {
        self.log.lock().push(format!("init:{}", self.id));
        Ok(())
    }

    fn start(&self, ctx: &RunContext) -> PluginResult<()> {
        self.log.lock().push(format!("start:{}", self.id));
        if self.fail_start {
            return Err(PluginError::failed("port already in use"));
        }
        while !ctx.is_cancelled() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    fn stop(&self) -> PluginResult<()> {
        self.log.lock().push(format!("stop:{}", self.id));
        Ok(())
    }
}

struct OnlyDriver;

impl Driver for OnlyDriver {
    fn name(&self) -> &str {
        "only.Driver"
    }

    fn accepts_url(&self, _url: &str) -> bool {
        false
    }

    fn connect(&self, _url: &str, _props: &ConnectionProperties) -> PluginResult<Box<dyn Connection>> {
        Err(PluginError::failed("not a real driver"))
    }
}

fn service_package(
    unit: &'static str,
    id: &'static str,
    log: &Log,
    fail_start: bool,
) -> impl Fn() -> PackageExport + Send + Sync + 'static {
    let log = log.clone();
    move || {
        let log = log.clone();
        PackageExport::new().unit(UnitDescriptor::plugin(unit, move || {
            Ok(Service {
                id,
                log: log.clone(),
                fail_start,
            })
        }))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: HostConfig,
    log: Log,
    events: Log,
    opener: InProcessOpener,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HostConfig::rooted_at(dir.path());
        config.stop_timeout_ms = 1_000;
        config.pool_shutdown_timeout_ms = 1_000;
        std::fs::create_dir_all(&config.plugin_dir).unwrap();

        let log = Log::default();
        let opener = InProcessOpener::new()
            .with_package("alpha.pkg", service_package("alpha.Main", "alpha", &log, true))
            .with_package("beta.pkg", service_package("beta.Main", "beta", &log, false))
            .with_package("driver-only.pkg", || {
                PackageExport::new().unit(UnitDescriptor::driver("only.Driver", || Ok(OnlyDriver)))
            });
        for name in opener.package_names() {
            std::fs::write(config.plugin_dir.join(name), b"").unwrap();
        }

        Self {
            _dir: dir,
            config,
            log,
            events: Log::default(),
            opener,
        }
    }

    fn manager(&self) -> PluginManager {
        let bus = Arc::new(EventBus::new());
        let events = self.events.clone();
        bus.subscribe(EventBus::ALL, move |event: &Event| {
            let id = match event {
                Event::PluginInstalled { id }
                | Event::PluginUninstalled { id }
                | Event::PluginLoaded { id }
                | Event::PluginStarted { id }
                | Event::PluginStopped { id }
                | Event::PluginError { id, .. } => id.clone(),
                _ => String::new(),
            };
            events.lock().push(format!("{}:{id}", event.kind()));
        });

        let loader = DynamicModuleLoader::new(&self.config.host_exports, Arc::new(DriverRegistry::new()))
            .with_opener(self.opener.clone())
            .with_events(bus.clone());
        let manager = PluginManager::new(
            self.config.clone(),
            Arc::new(loader),
            Arc::new(ModuleRegistry::new()),
            WorkerPool::current(),
            bus,
        );
        manager.load_manifest();
        manager
    }

    fn plugin_dir(&self) -> &Path {
        &self.config.plugin_dir
    }

    fn saw(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }
}

fn descriptor(id: &str, package: &str, entry: &str) -> PluginDescriptor {
    PluginDescriptor::new(id, id.to_uppercase())
        .with_version("2.1.0")
        .with_category("Services")
        .with_package(package)
        .with_entry_point(entry)
}

async fn wait_for_status(manager: &PluginManager, id: &str, status: PluginStatus) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if manager.status(id) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manifest_round_trip_preserves_catalog() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    assert!(fixture.plugin_dir().join("plugin-manifest.json").exists());

    let before: Vec<(String, String, String)> = manager
        .plugins()
        .into_iter()
        .map(|p| (p.id, p.name, p.version))
        .collect();
    assert!(!before.is_empty());

    manager.save_manifest().unwrap();
    let reloaded = fixture.manager();
    let after: Vec<(String, String, String)> = reloaded
        .plugins()
        .into_iter()
        .map(|p| (p.id, p.name, p.version))
        .collect();
    assert_eq!(before, after);
    assert_eq!(reloaded.load_manifest(), ManifestSource::Disk);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_uninstall_of_unknown_plugin_is_idempotent() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let before = manager.plugins();

    assert!(manager.uninstall_plugin("x").await.unwrap());
    assert!(manager.uninstall_plugin("x").await.unwrap());

    assert_eq!(manager.plugins(), before);
    assert!(manager.plugin("x").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_install_requires_existing_package() {
    let fixture = Fixture::new();
    let manager = fixture.manager();

    let no_package = PluginDescriptor::new("bare", "Bare");
    assert!(!manager.install_plugin(no_package).unwrap());

    let missing = descriptor("ghost", "ghost.pkg", "ghost.Main");
    assert!(!manager.install_plugin(missing).unwrap());
    assert!(manager.plugin("ghost").is_none());

    let beta = descriptor("beta", "beta.pkg", "beta.Main");
    assert!(manager.install_plugin(beta).unwrap());
    assert_eq!(manager.status("beta"), Some(PluginStatus::Installed));
    assert!(fixture.saw("plugin_installed:beta"));

    let reloaded = fixture.manager();
    let beta = reloaded.plugin("beta").unwrap();
    assert!(beta.installed);
    assert_eq!(beta.status, PluginStatus::Installed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failing_start_does_not_stop_other_plugins() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    manager
        .install_plugin(descriptor("alpha", "alpha.pkg", "alpha.Main"))
        .unwrap();
    manager
        .install_plugin(descriptor("beta", "beta.pkg", "beta.Main").with_dependency("alpha"))
        .unwrap();

    let results = manager.start_all_enabled_plugins().await;
    let attempted: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(attempted, vec!["alpha", "beta"]);

    assert!(wait_for_status(&manager, "alpha", PluginStatus::Error).await);
    assert_eq!(manager.status("beta"), Some(PluginStatus::Running));
    assert!(fixture.saw("plugin_error:alpha"));
    assert!(fixture.saw("plugin_started:beta"));

    // Starting again is a no-op while running.
    assert!(manager.start_plugin("beta").await);
    assert_eq!(
        fixture.log.lock().iter().filter(|e| *e == "start:beta").count(),
        1
    );

    manager.shutdown().await;
    assert!(fixture.log.lock().contains(&"stop:beta".to_string()));
    assert_eq!(manager.status("beta"), Some(PluginStatus::Installed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_plugin_is_idempotent() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    manager
        .install_plugin(descriptor("beta", "beta.pkg", "beta.Main"))
        .unwrap();

    assert!(manager.stop_plugin("beta").await);
    assert!(manager.start_plugin("beta").await);
    assert_eq!(manager.status("beta"), Some(PluginStatus::Running));

    assert!(manager.stop_plugin("beta").await);
    assert_eq!(manager.status("beta"), Some(PluginStatus::Installed));
    assert!(fixture.saw("plugin_stopped:beta"));
    assert!(manager.stop_plugin("beta").await);

    let stops = fixture.log.lock().iter().filter(|e| *e == "stop:beta").count();
    assert_eq!(stops, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_plugin_caches_instance() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let beta = descriptor("beta", "beta.pkg", "beta.Main");
    manager.install_plugin(beta.clone()).unwrap();

    let first = manager.load_plugin(&beta).unwrap();
    let second = manager.load_plugin(&beta).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.unit(), "beta.Main");
    assert_eq!(
        fixture.log.lock().iter().filter(|e| *e == "init:beta").count(),
        1
    );
    assert!(fixture.saw("plugin_loaded:beta"));
    assert_eq!(manager.status("beta"), Some(PluginStatus::Installed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_plugin_rejects_non_plugin_entry() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let only = descriptor("only", "driver-only.pkg", "only.Driver");
    manager.install_plugin(only.clone()).unwrap();

    assert!(manager.load_plugin(&only).is_none());
    assert_eq!(manager.status("only"), Some(PluginStatus::Error));
    assert!(fixture.saw("plugin_error:only"));

    let wrong_entry = descriptor("beta", "beta.pkg", "beta.Missing");
    manager.install_plugin(wrong_entry.clone()).unwrap();
    assert!(manager.load_plugin(&wrong_entry).is_none());
    assert_eq!(manager.status("beta"), Some(PluginStatus::Error));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_enable_and_disable_persist() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    manager
        .install_plugin(descriptor("beta", "beta.pkg", "beta.Main"))
        .unwrap();
    assert!(manager.start_plugin("beta").await);

    assert!(manager.disable_plugin("beta").await.unwrap());
    assert_eq!(manager.status("beta"), Some(PluginStatus::Disabled));
    assert!(fixture.log.lock().contains(&"stop:beta".to_string()));
    assert!(!manager.start_plugin("beta").await);

    let reloaded = fixture.manager();
    assert!(!reloaded.plugin("beta").unwrap().enabled);
    assert_eq!(reloaded.status("beta"), Some(PluginStatus::Disabled));

    assert!(reloaded.enable_plugin("beta").unwrap());
    assert_eq!(reloaded.status("beta"), Some(PluginStatus::Installed));
    assert!(!reloaded.enable_plugin("nope").unwrap());
    assert!(!reloaded.disable_plugin("nope").await.unwrap());

    manager.shutdown().await;
    reloaded.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_uninstall_stops_and_releases() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    manager
        .install_plugin(descriptor("beta", "beta.pkg", "beta.Main"))
        .unwrap();
    let shim = manager.load_plugin(&manager.plugin("beta").unwrap()).unwrap();
    assert!(manager.start_plugin("beta").await);

    assert!(manager.uninstall_plugin("beta").await.unwrap());
    assert!(fixture.log.lock().contains(&"stop:beta".to_string()));
    assert!(shim.context().is_closed());
    assert_eq!(manager.status("beta"), Some(PluginStatus::Available));
    assert!(!manager.plugin("beta").unwrap().installed);
    assert!(fixture.saw("plugin_uninstalled:beta"));

    let reloaded = fixture.manager();
    assert!(!reloaded.plugin("beta").unwrap().installed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_plugins_in_category() {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    manager
        .install_plugin(descriptor("beta", "beta.pkg", "beta.Main"))
        .unwrap();

    let services: Vec<String> = manager
        .plugins_in_category("services")
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(services, vec!["beta"]);
    assert!(manager.plugins_in_category("nothing").is_empty());
    assert!(manager.categories().contains(&"Services".to_string()));
}
