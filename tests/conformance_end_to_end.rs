//! End-to-end runs against the in-memory subsystem.
//!
//! Producer directories are real temporary directories holding a descriptor
//! file, so discovery runs exactly as it would against an installation.

use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;

use gentl_conformance::mock::{MockDevice, MockSubsystem};
use gentl_conformance::property::{ConstraintKind, PropertyInfo, PropertyType, PropertyValue};
use gentl_conformance::{
    resolve, ConfigurationBuilder, ConformanceError, FormatTesting, HardwareSpecCache,
    ProducerRef, RunParameters, RunReport, SubsystemSession, Summary, TestOrchestrator,
};
use tempfile::TempDir;
use tracing_test::traced_test;

struct Installation {
    root: TempDir,
    producers: Vec<PathBuf>,
}

impl Installation {
    fn new(names: &[&str]) -> Self {
        let root = TempDir::new().expect("tempdir failed");
        let producers = names
            .iter()
            .map(|name| {
                let dir = root.path().join(name);
                fs::create_dir_all(&dir).expect("mkdir failed");
                fs::write(dir.join("producer.cti"), b"descriptor").expect("write failed");
                dir
            })
            .collect();
        Self { root, producers }
    }

    fn search_path(&self) -> OsString {
        env::join_paths(&self.producers).expect("join failed")
    }

    fn refs(&self) -> Vec<ProducerRef> {
        self.producers.iter().map(ProducerRef::new).collect()
    }

    fn cache(&self) -> HardwareSpecCache {
        HardwareSpecCache::new(self.root.path().join("hwspecs"))
    }

    fn run(&self, session: &SubsystemSession, tokens: &[&str], params: &RunParameters) -> RunReport {
        self.try_run(session, tokens, params).expect("run failed")
    }

    fn try_run(
        &self,
        session: &SubsystemSession,
        tokens: &[&str],
        params: &RunParameters,
    ) -> gentl_conformance::Result<RunReport> {
        let cache = self.cache();
        TestOrchestrator::new(session, &cache, self.root.path().join("scratch"))
            .search_path(Some(self.search_path()))
            .run(&resolve(tokens), params)
    }
}

fn cameras(user_ids: [&str; 3]) -> Vec<MockDevice> {
    vec![
        MockDevice::new("Cam A (SN1)").with_user_id(user_ids[0]),
        MockDevice::new("Cam B (SN2)").with_user_id(user_ids[1]),
        MockDevice::new("Cam C (SN3)")
            .with_user_id(user_ids[2])
            .with_formats(&["Mono8", "BayerRG8"], "BayerRG8"),
    ]
}

#[test]
fn test_full_run_on_simulated_installation() {
    let install = Installation::new(&["a", "b"]);
    let session = SubsystemSession::new(MockSubsystem::simulated(&install.refs()));

    let report = install.run(&session, &[], &RunParameters::default());

    // 13 points: 9 device-level points over 6 configurations, 2 format points
    // over 16 format configurations, 2 device-list points once per producer.
    assert_eq!(report.results.len(), 9 * 6 + 2 * 16 + 2 * 2);
    assert!(report.warnings.is_empty());

    let summary = Summary::summarize(&report.results, &report.configurations);
    assert_eq!(summary.failed, 0, "{}", summary.render());
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(
        fs::read_dir(install.root.path().join("scratch"))
            .expect("scratch missing")
            .count(),
        0
    );
}

#[test]
fn test_configuration_cross_product() {
    let install = Installation::new(&["a", "b"]);
    let session = SubsystemSession::new(MockSubsystem::simulated(&install.refs()));

    let all = ConfigurationBuilder::new(&session)
        .search_path(Some(install.search_path()))
        .build()
        .expect("build failed");
    assert_eq!(all.len(), 6);

    let filtered = ConfigurationBuilder::new(&session)
        .search_path(Some(install.search_path()))
        .device_ids(Some(vec![1, 3, 9]))
        .build()
        .expect("build failed");
    assert_eq!(filtered.len(), 4);
    assert!(filtered
        .iter()
        .all(|config| matches!(config.device.hardware_id, 1 | 3)));

    let formats = ConfigurationBuilder::new(&session)
        .search_path(Some(install.search_path()))
        .formats(FormatTesting::Only(vec!["BayerRG8".to_owned()]))
        .build()
        .expect("build failed");
    assert_eq!(formats.len(), 2);
    assert!(formats
        .iter()
        .all(|config| config.format.as_deref() == Some("BayerRG8")));
}

#[test]
fn test_spec_cache_hit_does_not_open_devices() {
    let install = Installation::new(&["a", "b"]);
    let subsystem = MockSubsystem::simulated(&install.refs());
    let counters = subsystem.counters();
    let session = SubsystemSession::new(subsystem);
    let cache = install.cache();

    let build = || {
        ConfigurationBuilder::new(&session)
            .search_path(Some(install.search_path()))
            .spec_cache(&cache)
            .build()
            .expect("build failed")
    };

    let set = build();
    let opens_after_first = counters.opens();
    // Both producers see the same three cameras, so three artifacts.
    assert_eq!(opens_after_first, 3);

    let key = &set.iter().next().expect("no configurations").device.spec_file_key;
    let first_bytes = fs::read(cache.path_for(key)).expect("artifact missing");

    build();
    assert_eq!(counters.opens(), opens_after_first);
    assert_eq!(fs::read(cache.path_for(key)).expect("artifact missing"), first_bytes);

    let spec = cache.lookup(key).expect("lookup failed").expect("cache miss");
    cache.store(&spec).expect("store failed");
    assert_eq!(fs::read(cache.path_for(key)).expect("artifact missing"), first_bytes);
}

#[test]
fn test_selection_runs_only_requested_points() {
    let install = Installation::new(&["a"]);
    let session = SubsystemSession::new(MockSubsystem::simulated(&install.refs()));

    let report = install.run(
        &session,
        &["tacquisition/verifysnapshot", "tFoo", "tVideoinput"],
        &RunParameters::default(),
    );
    let mut names: Vec<&str> = report.results.iter().map(|r| r.test_name.as_str()).collect();
    names.dedup();
    assert_eq!(
        names,
        vec![
            "tVideoinput/verifyVideoinputObj",
            "tVideoinput/verifySelectedSource",
            "tAcquisition/verifySnapshot",
        ]
    );
    assert_eq!(report.results.len(), 3 * 3);
}

#[test]
#[traced_test]
fn test_device_list_file_ignores_device_ids() {
    let install = Installation::new(&["a", "b"]);
    let session = SubsystemSession::new(MockSubsystem::simulated(&install.refs()));
    let params = RunParameters {
        device_ids: Some(vec![2]),
        ..RunParameters::default()
    };

    let report = install.run(&session, &["tDevices"], &params);

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].file, "tDevices");
    assert_eq!(report.configurations.len(), 2);
    assert_eq!(report.results.len(), 4);
    assert!(report.results.iter().all(|r| r.passed()));
    assert!(report
        .configurations
        .iter()
        .all(|config| config.format.is_none() && config.device.hardware_id == 1));

    logs_assert(|lines: &[&str]| {
        let count = lines
            .iter()
            .filter(|line| line.contains("tDevices does not accept the device parameter(s)"))
            .count();
        if count == 1 {
            Ok(())
        } else {
            Err(format!("expected one suppression warning, saw {count}"))
        }
    });
}

#[test]
fn test_formats_bound_only_to_format_file() {
    let install = Installation::new(&["a"]);
    let session = SubsystemSession::new(MockSubsystem::simulated(&install.refs()));
    let params = RunParameters {
        formats: Some(vec!["Mono16".to_owned()]),
        ..RunParameters::default()
    };

    let report = install.run(&session, &["tVideoinput", "tFormats"], &params);

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].file, "tVideoinput");
    let format_results: Vec<_> = report
        .results
        .iter()
        .filter(|r| r.test_name.starts_with("tFormats/"))
        .collect();
    // Only cameras A and B support Mono16.
    assert_eq!(format_results.len(), 2 * 2);
    assert!(format_results.iter().all(|r| r.passed()));
}

#[test]
fn test_flipped_user_id_is_detected() {
    let install = Installation::new(&["a", "b"]);
    let subsystem = MockSubsystem::new()
        .with_producer(&install.producers[0], cameras(["cam-a", "cam-b", "cam-c"]))
        .with_producer(&install.producers[1], cameras(["cam-a", "cam-b", "cam-x"]));
    let session = SubsystemSession::new(subsystem);

    let report = install.run(&session, &["tDevices/verifyAllDevices"], &RunParameters::default());
    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(|r| r.failed()));

    let summary = Summary::summarize(&report.results, &report.configurations);
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.rows.iter().any(|row| row.detail.contains("cam-c")));
    assert!(summary.render().contains("verifyAllDevices"));
}

#[test]
fn test_consistent_installation_passes_device_checks() {
    let install = Installation::new(&["a", "b"]);
    let subsystem = MockSubsystem::new()
        .with_producer(&install.producers[0], cameras(["cam-a", "cam-b", "cam-c"]))
        .with_producer(&install.producers[1], cameras(["cam-a", "cam-b", "cam-c"]));
    let session = SubsystemSession::new(subsystem);

    let report = install.run(&session, &["tDevices"], &RunParameters::default());
    let summary = Summary::summarize(&report.results, &report.configurations);
    assert_eq!(summary.passed, 4);
    assert_eq!(summary.render(), "All 4 test points passed.\n");
}

#[test]
fn test_streaming_timeout_fails_without_aborting() {
    let install = Installation::new(&["a"]);
    let session = SubsystemSession::new(
        MockSubsystem::simulated(&install.refs()).with_capture_polls(u32::MAX),
    );
    let cache = install.cache();

    let report = TestOrchestrator::new(&session, &cache, install.root.path().join("scratch"))
        .search_path(Some(install.search_path()))
        .timing(gentl_conformance::points::StreamTiming {
            timeout: std::time::Duration::from_millis(50),
            poll_interval: std::time::Duration::from_millis(5),
        })
        .run(
            &resolve(&["tAcquisition/verifyStreaming", "tVideoinput/verifyVideoinputObj"]),
            &RunParameters::default(),
        )
        .expect("run failed");

    let summary = Summary::summarize(&report.results, &report.configurations);
    assert_eq!(summary.failed, 3);
    assert_eq!(summary.passed, 3);
    assert!(summary.rows.iter().all(|row| row.outcome.contains("timeout")
        || row.outcome.contains("cleanup")));
    assert_eq!(session.active_producer().expect("lock failed"), None);
}

#[test]
fn test_no_devices_is_fatal() {
    let install = Installation::new(&["a", "b"]);
    let subsystem = MockSubsystem::new()
        .with_producer(&install.producers[0], Vec::new())
        .with_producer(&install.producers[1], Vec::new());
    let session = SubsystemSession::new(subsystem);

    let err = install
        .try_run(&session, &[], &RunParameters::default())
        .expect_err("run should fail");
    assert!(matches!(err, ConformanceError::NoDevicesFound(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_broken_producer_is_skipped() {
    let install = Installation::new(&["a", "b"]);
    let subsystem = MockSubsystem::new()
        .with_broken_producer(&install.producers[0])
        .with_producer(&install.producers[1], cameras(["cam-a", "cam-b", "cam-c"]));
    let session = SubsystemSession::new(subsystem);

    let report = install.run(&session, &["tVideoinput/verifyVideoinputObj"], &RunParameters::default());
    assert_eq!(report.configurations.len(), 3);
    assert!(report
        .configurations
        .iter()
        .all(|config| config.producer.path() == install.producers[1]));
}

#[test]
fn test_custom_camera_properties_reach_the_spec() {
    let install = Installation::new(&["a"]);
    let camera = MockDevice::new("Cam Small (SN9)")
        .with_resolution(320, 240)
        .with_source_property(PropertyInfo {
            name: "BlackLevel".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::Bounded,
            constraint_value: Some(PropertyValue::NumericArray(vec![0.0, 255.0])),
            default_value: PropertyValue::NumericScalar(0.1),
            read_only: true,
            device_specific: true,
        });
    let session = SubsystemSession::new(
        MockSubsystem::new().with_producer(&install.producers[0], vec![camera]),
    );

    let report = install.run(&session, &["tProperties", "tFormats"], &RunParameters::default());
    let summary = Summary::summarize(&report.results, &report.configurations);
    assert_eq!(summary.failed, 0, "{}", summary.render());

    let key = &report
        .configurations
        .iter()
        .next()
        .expect("no configurations")
        .device
        .spec_file_key;
    let spec = install
        .cache()
        .lookup(key)
        .expect("lookup failed")
        .expect("cache miss");
    let record = spec.property("BlackLevel").expect("BlackLevel missing");
    assert!(record.read_only && record.runtime_defined);
    assert_eq!(record.default_value, PropertyValue::NumericScalar(0.1));
}

#[test]
fn test_producer_without_devices_fails_device_check() {
    let install = Installation::new(&["a", "b"]);
    let subsystem = MockSubsystem::new()
        .with_producer(&install.producers[0], cameras(["cam-a", "cam-b", "cam-c"]))
        .with_producer(&install.producers[1], Vec::new());
    let session = SubsystemSession::new(subsystem);

    let report = install.run(&session, &["tDevices/verifyAllDevices"], &RunParameters::default());
    assert_eq!(report.configurations.len(), 1);
    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].failed());

    let summary = Summary::summarize(&report.results, &report.configurations);
    assert_eq!(summary.exit_code(), 1);
    let detail = &summary.rows[0].detail;
    assert!(
        ["cam-a", "cam-b", "cam-c"].iter().all(|id| detail.contains(id)),
        "{detail}"
    );
}
