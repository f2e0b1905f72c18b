//! Load, reload and unload real widget libraries through `DylibBackend`
//!
//! The sample widget crates and the fixture modules under `tests/fixtures`
//! are built once into a private target directory, then copied into a
//! temporary widget directory per test.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use dashkit_host::{EventBus, HostConfig, LoadError, UiDispatcher, WidgetManager, topics};
use tempfile::TempDir;

struct ModuleArtifacts {
    text: PathBuf,
    charts: PathBuf,
    abi_mismatch: PathBuf,
    missing_register: PathBuf,
}

static ARTIFACTS: OnceLock<ModuleArtifacts> = OnceLock::new();

fn artifacts() -> &'static ModuleArtifacts {
    ARTIFACTS.get_or_init(|| {
        let crate_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let workspace = crate_root.join("../../Cargo.toml");
        let target_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join("dashkit-modules");

        cargo_build(&workspace, &["-p", "text-widget", "-p", "charts-widget"], &target_dir);
        cargo_build(&crate_root.join("tests/fixtures/abi-mismatch/Cargo.toml"), &[], &target_dir);
        cargo_build(&crate_root.join("tests/fixtures/missing-register/Cargo.toml"), &[], &target_dir);

        let debug = target_dir.join("debug");
        ModuleArtifacts {
            text: debug.join(dylib_filename("text-widget")),
            charts: debug.join(dylib_filename("charts-widget")),
            abi_mismatch: debug.join(dylib_filename("abi-mismatch-module")),
            missing_register: debug.join(dylib_filename("missing-register-module")),
        }
    })
}

fn cargo_build(manifest_path: &Path, args: &[&str], target_dir: &Path) {
    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let status = Command::new(cargo)
        .arg("build")
        .arg("--manifest-path")
        .arg(manifest_path)
        .arg("--target-dir")
        .arg(target_dir)
        .args(args)
        .status()
        .expect("spawn cargo build for widget module");
    assert!(status.success(), "module build failed: {}", manifest_path.display());
}

fn dylib_filename(crate_name: &str) -> String {
    let base = crate_name.replace('-', "_");
    match std::env::consts::OS {
        "windows" => format!("{base}.dll"),
        "linux" => format!("lib{base}.so"),
        "macos" => format!("lib{base}.dylib"),
        other => panic!("unsupported test platform: {other}"),
    }
}

struct DylibHost {
    manager: WidgetManager,
    bus: EventBus,
    widgets: TempDir,
    _staging: TempDir,
}

impl DylibHost {
    fn new() -> Self {
        let widgets = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let config = HostConfig::default()
            .with_widgets_dir(widgets.path())
            .with_staging_root(staging.path().join("shadow"))
            .with_watch(false);
        let bus = EventBus::new();
        let dispatcher = UiDispatcher::spawn("dashkit-dylib-ui").unwrap();
        let manager = WidgetManager::new(config, bus.clone(), dispatcher).unwrap();

        Self {
            manager,
            bus,
            widgets,
            _staging: staging,
        }
    }

    fn install(&self, artifact: &Path, file_name: &str) {
        std::fs::copy(artifact, self.widgets.path().join(file_name)).unwrap();
    }

    fn submit(&self, text: &str) -> usize {
        let bus = self.bus.clone();
        let text = text.to_string();
        self.manager
            .dispatcher()
            .invoke(move || bus.publish(topics::DATA_SUBMITTED, &text))
            .unwrap()
    }

    fn render(&self, name: &str) -> String {
        self.manager.with_widgets(|generation| {
            generation
                .find(name)
                .map(|instance| instance.view().render())
                .unwrap_or_default()
        })
    }
}

fn module_file(stem: &str) -> String {
    format!("{stem}.{}", std::env::consts::DLL_EXTENSION)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sample_widgets_load_reload_and_unload() {
    let modules = artifacts();
    let host = DylibHost::new();
    host.install(&modules.text, &module_file("text"));
    host.install(&modules.charts, &module_file("charts"));

    let report = host.manager.start().await.unwrap();
    assert!(report.is_clean(), "unexpected errors: {:?}", report.errors());

    let mut names = host.manager.widget_names();
    names.sort();
    assert_eq!(names, vec!["Charts Widget", "Text Widget"]);
    assert_eq!(host.manager.resident_contexts(), 2);
    assert_eq!(host.render("Text Widget"), "Waiting for data...");

    assert_eq!(host.submit("1 2 3"), 2);
    assert_eq!(host.render("Text Widget"), "1 2 3\nCharacters: 5\nWords: 3");
    assert!(host.render("Charts Widget").contains("3.0"));

    let report = host.manager.reload().await.unwrap();
    assert!(report.is_clean(), "unexpected errors: {:?}", report.errors());
    assert_eq!(report.unloaded_contexts, 2);
    assert_eq!(host.manager.resident_contexts(), 2);
    assert_eq!(host.bus.subscriber_count(topics::DATA_SUBMITTED), 2);
    assert_eq!(host.render("Text Widget"), "Waiting for data...");

    std::fs::remove_file(host.widgets.path().join(module_file("charts"))).unwrap();
    host.manager.reload().await.unwrap();
    assert_eq!(host.manager.widget_names(), vec!["Text Widget"]);
    assert_eq!(host.manager.resident_contexts(), 1);

    let unloaded = host.manager.shutdown().await.unwrap();
    assert!(unloaded.is_clean(), "unload left work behind: {unloaded:?}");
    assert_eq!(host.manager.resident_contexts(), 0);
    assert_eq!(host.bus.subscriber_count(topics::DATA_SUBMITTED), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retained_view_keeps_library_loaded() {
    let modules = artifacts();
    let host = DylibHost::new();
    host.install(&modules.text, &module_file("text"));
    host.manager.start().await.unwrap();
    host.submit("kept");

    let view = host.manager.widgets().instances()[0].view();
    std::fs::remove_file(host.widgets.path().join(module_file("text"))).unwrap();
    let report = host.manager.reload().await.unwrap();

    assert!(host.manager.widgets().is_empty());
    assert_eq!(report.leaked_contexts, vec![module_file("text")]);
    assert_eq!(view.render(), "kept\nCharacters: 4\nWords: 1");

    drop(view);
    let report = host.manager.reload().await.unwrap();
    assert!(report.leaked_contexts.is_empty());
    assert_eq!(host.manager.resident_contexts(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_incompatible_modules_are_rejected() {
    let modules = artifacts();
    let host = DylibHost::new();
    host.install(&modules.abi_mismatch, &module_file("a-future"));
    host.install(&modules.missing_register, &module_file("b-unregistered"));
    host.install(&modules.text, &module_file("c-text"));

    let report = host.manager.start().await.unwrap();

    assert_eq!(host.manager.widget_names(), vec!["Text Widget"]);
    assert_eq!(report.load_errors.len(), 2);
    assert!(matches!(
        report.load_errors[0],
        LoadError::AbiMismatch { expected: 1, actual: 2, .. }
    ));
    assert!(matches!(
        report.load_errors[1],
        LoadError::MissingSymbol { ref symbol, .. } if symbol == "dashkit_register"
    ));
    assert_eq!(host.manager.resident_contexts(), 1);
}
