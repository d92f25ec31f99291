//! Test selection, parameter binding, and sequential execution.
//!
//! The registry is fixed: five test files, each with an ordered list of test
//! points and the parameter categories it honours. A run resolves a selection
//! against the registry, builds one configuration set per distinct binding,
//! and executes every selected point against every bound configuration, one at
//! a time.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, info_span, warn};

use crate::config::{
    ConfigKey, ConfigurationBuilder, ConfigurationSet, FormatTesting, TestConfiguration,
};
use crate::error::{PointError, PointResult, Result};
use crate::points::{self, PointContext, StreamTiming};
use crate::session::SubsystemSession;
use crate::spec_cache::HardwareSpecCache;
use crate::traits::ProducerRef;
use ParameterCategory::{Device, Format, Producer};

/// Signature shared by every test point.
pub type PointFn = fn(&PointContext<'_>) -> PointResult;

/// One test point of a test file.
#[derive(Debug, Clone, Copy)]
pub struct TestPoint {
    /// Point name, unique within its file.
    pub name: &'static str,
    /// Implementation.
    pub run: PointFn,
}

/// A user-suppliable parameter category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParameterCategory {
    /// Producer directory list.
    Producer,
    /// Hardware ID list.
    Device,
    /// Pixel format list.
    Format,
}

impl fmt::Display for ParameterCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Producer => "producer",
            Self::Device => "device",
            Self::Format => "format",
        })
    }
}

/// A test file: named group of points sharing one parameter declaration.
#[derive(Debug)]
pub struct TestFile {
    /// File name.
    pub name: &'static str,
    /// Default point list, in execution order.
    pub points: &'static [TestPoint],
    /// Parameter categories this file accepts.
    pub honours: &'static [ParameterCategory],
    /// Whether configurations are always expanded by format.
    pub format_expanded: bool,
}

impl TestFile {
    /// Whether this file accepts `category`.
    pub fn honours(&self, category: ParameterCategory) -> bool {
        self.honours.contains(&category)
    }

    fn point(&self, name: &str) -> Option<usize> {
        self.points
            .iter()
            .position(|point| point.name.eq_ignore_ascii_case(name))
    }
}

/// The fixed registry of test files.
pub static REGISTRY: [TestFile; 5] = [
    TestFile {
        name: "tVideoinput",
        points: &[
            TestPoint { name: "verifyVideoinputObj", run: points::verify_videoinput_obj },
            TestPoint { name: "verifySelectedSource", run: points::verify_selected_source },
        ],
        honours: &[Producer, Device],
        format_expanded: false,
    },
    TestFile {
        name: "tAcquisition",
        points: &[
            TestPoint { name: "verifySnapshot", run: points::verify_snapshot },
            TestPoint { name: "verifyStreaming", run: points::verify_streaming },
            TestPoint { name: "verifyDiskLogging", run: points::verify_disk_logging },
            TestPoint { name: "verifyRegionOfInterest", run: points::verify_region_of_interest },
        ],
        honours: &[Producer, Device],
        format_expanded: false,
    },
    TestFile {
        name: "tProperties",
        points: &[
            TestPoint { name: "verifyPropertyNames", run: points::verify_property_names },
            TestPoint { name: "verifyPropertyDefaults", run: points::verify_property_defaults },
            TestPoint { name: "verifyReadOnlyProperties", run: points::verify_read_only_properties },
        ],
        honours: &[Producer, Device],
        format_expanded: false,
    },
    TestFile {
        name: "tFormats",
        points: &[
            TestPoint { name: "verifyFormatSnapshot", run: points::verify_format_snapshot },
            TestPoint { name: "verifyFormatResolution", run: points::verify_format_resolution },
        ],
        honours: &[Producer, Device, Format],
        format_expanded: true,
    },
    TestFile {
        name: "tDevices",
        points: &[
            TestPoint { name: "verifyDeviceIdSequence", run: points::verify_device_id_sequence },
            TestPoint { name: "verifyAllDevices", run: points::verify_all_devices },
        ],
        honours: &[Producer],
        format_expanded: false,
    },
];

/// Points selected from one test file, in registry order.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    /// Test file.
    pub file: &'static TestFile,
    /// Selected points.
    pub points: Vec<&'static TestPoint>,
}

/// Selection resolved against the registry, in registry order.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    files: Vec<ResolvedFile>,
}

impl Selection {
    /// Selected files.
    pub fn files(&self) -> &[ResolvedFile] {
        &self.files
    }

    /// Whether nothing was selected.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// File name to point names.
    pub fn names(&self) -> Vec<(&'static str, Vec<&'static str>)> {
        self.files
            .iter()
            .map(|resolved| {
                (
                    resolved.file.name,
                    resolved.points.iter().map(|point| point.name).collect(),
                )
            })
            .collect()
    }
}

/// Resolve `file` and `file/point` tokens against the registry.
///
/// An empty selection, or the token `all`, selects everything. Matching is
/// case-insensitive. Unknown tokens are logged and ignored.
pub fn resolve<S: AsRef<str>>(tokens: &[S]) -> Selection {
    let mut chosen: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); REGISTRY.len()];
    let select_all = tokens.is_empty()
        || tokens
            .iter()
            .any(|token| token.as_ref().trim().eq_ignore_ascii_case("all"));

    if select_all {
        for (set, file) in chosen.iter_mut().zip(&REGISTRY) {
            set.extend(0..file.points.len());
        }
    } else {
        for token in tokens {
            let token = token.as_ref().trim();
            let (file_name, point_name) = match token.split_once('/') {
                Some((file, point)) => (file, Some(point)),
                None => (token, None),
            };
            let Some(index) = REGISTRY
                .iter()
                .position(|file| file.name.eq_ignore_ascii_case(file_name))
            else {
                warn!(token, "unknown test file in selection, ignoring");
                continue;
            };
            let (Some(file), Some(set)) = (REGISTRY.get(index), chosen.get_mut(index)) else {
                continue;
            };

            match point_name {
                None => set.extend(0..file.points.len()),
                Some(point) => match file.point(point) {
                    Some(position) => {
                        set.insert(position);
                    }
                    None => warn!(token, "unknown test point in selection, ignoring"),
                },
            }
        }
    }

    let files = REGISTRY
        .iter()
        .zip(chosen)
        .filter(|(_, set)| !set.is_empty())
        .map(|(file, set)| ResolvedFile {
            file,
            points: set.into_iter().filter_map(|i| file.points.get(i)).collect(),
        })
        .collect();
    Selection { files }
}

/// User-supplied parameter overrides. `None` means "not supplied".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParameters {
    /// Producer directories instead of discovery.
    pub producers: Option<Vec<PathBuf>>,
    /// Hardware IDs to test.
    pub device_ids: Option<Vec<u32>>,
    /// Pixel formats to test.
    pub formats: Option<Vec<String>>,
}

impl RunParameters {
    /// Categories with a supplied value.
    pub fn supplied(&self) -> Vec<ParameterCategory> {
        let mut supplied = Vec::new();
        if self.producers.is_some() {
            supplied.push(Producer);
        }
        if self.device_ids.is_some() {
            supplied.push(Device);
        }
        if self.formats.is_some() {
            supplied.push(Format);
        }
        supplied
    }

    /// Parameters `file` accepts, plus a warning for everything it does not.
    pub fn bind(&self, file: &TestFile) -> (FileParameters, Option<ParameterWarning>) {
        let suppressed: Vec<ParameterCategory> = self
            .supplied()
            .into_iter()
            .filter(|category| !file.honours(*category))
            .collect();

        let formats = if file.format_expanded {
            self.formats
                .clone()
                .filter(|_| file.honours(Format))
                .map_or(FormatTesting::All, FormatTesting::Only)
        } else {
            FormatTesting::Disabled
        };
        let bound = FileParameters {
            producers: self.producers.clone().filter(|_| file.honours(Producer)),
            device_ids: self.device_ids.clone().filter(|_| file.honours(Device)),
            formats,
            per_producer: !file.honours(Device),
        };

        let warning = if suppressed.is_empty() {
            None
        } else {
            let warning = ParameterWarning {
                file: file.name,
                suppressed,
            };
            warn!(file = file.name, "{warning}");
            Some(warning)
        };
        (bound, warning)
    }
}

/// Parameters as accepted by one test file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileParameters {
    /// Producer override.
    pub producers: Option<Vec<PathBuf>>,
    /// Device override.
    pub device_ids: Option<Vec<u32>>,
    /// Format expansion.
    pub formats: FormatTesting,
    /// Run once per producer rather than once per device.
    pub per_producer: bool,
}

/// Parameters a test file ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterWarning {
    /// Test file.
    pub file: &'static str,
    /// Supplied but ignored categories.
    pub suppressed: Vec<ParameterCategory>,
}

impl fmt::Display for ParameterWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.suppressed.iter().map(ToString::to_string).collect();
        write!(
            f,
            "{} does not accept the {} parameter(s); ignoring",
            self.file,
            names.join(", ")
        )
    }
}

/// Why a test point failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Expected and actual values differed.
    Assertion,
    /// A streaming wait expired.
    Timeout,
    /// The subsystem or cache returned an error.
    Subsystem,
    /// Sessions, temporary files or producer state were left behind.
    Cleanup,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Assertion => "assertion",
            Self::Timeout => "timeout",
            Self::Subsystem => "subsystem",
            Self::Cleanup => "cleanup",
        })
    }
}

/// Terminal state of one test point execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Ran and passed.
    Passed,
    /// Ran and failed.
    Failed {
        /// Category.
        kind: FailureKind,
        /// Description.
        message: String,
    },
    /// Preconditions not met by the configuration.
    Incomplete {
        /// Unmet assumption.
        reason: String,
    },
}

impl From<PointResult> for Outcome {
    fn from(result: PointResult) -> Self {
        match result {
            Ok(()) => Self::Passed,
            Err(PointError::AssumptionNotMet(reason)) => Self::Incomplete { reason },
            Err(err @ PointError::AssertionFailure(_)) => Self::Failed {
                kind: FailureKind::Assertion,
                message: err.to_string(),
            },
            Err(err @ PointError::Timeout { .. }) => Self::Failed {
                kind: FailureKind::Timeout,
                message: err.to_string(),
            },
            Err(PointError::Subsystem(err)) => Self::Failed {
                kind: FailureKind::Subsystem,
                message: err.to_string(),
            },
        }
    }
}

/// One executed test point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    /// `file/point`.
    pub test_name: String,
    /// Configuration the point ran against.
    pub configuration_key: ConfigKey,
    /// Outcome.
    pub outcome: Outcome,
}

impl TestResult {
    /// Whether the point passed.
    pub const fn passed(&self) -> bool {
        matches!(self.outcome, Outcome::Passed)
    }

    /// Whether the point failed.
    pub const fn failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }

    /// Whether the point was incomplete.
    pub const fn incomplete(&self) -> bool {
        matches!(self.outcome, Outcome::Incomplete { .. })
    }
}

/// Everything a run produced.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Every configuration any file was bound to.
    pub configurations: ConfigurationSet,
    /// Results in execution order.
    pub results: Vec<TestResult>,
    /// One entry per file that ignored supplied parameters.
    pub warnings: Vec<ParameterWarning>,
}

/// A distinct parameter binding and what it resolved to.
struct Binding {
    params: FileParameters,
    keys: Vec<ConfigKey>,
    /// Every discovered producer, including those that yielded no configuration.
    producers: Vec<ProducerRef>,
}

/// Runs a selection against the configurations built from the subsystem.
#[derive(Debug)]
pub struct TestOrchestrator<'a> {
    session: &'a SubsystemSession,
    spec_cache: &'a HardwareSpecCache,
    scratch_dir: PathBuf,
    search_path: Option<OsString>,
    timing: StreamTiming,
}

impl<'a> TestOrchestrator<'a> {
    /// Orchestrator writing temporary artifacts under `scratch_dir`.
    pub fn new(
        session: &'a SubsystemSession,
        spec_cache: &'a HardwareSpecCache,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session,
            spec_cache,
            scratch_dir: scratch_dir.into(),
            search_path: None,
            timing: StreamTiming::default(),
        }
    }

    /// Producer search path. Defaults to the environment.
    #[must_use]
    pub fn search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Streaming wait bounds.
    #[must_use]
    pub const fn timing(mut self, timing: StreamTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Bind and execute `selection`.
    ///
    /// Fails only on fatal errors: nothing discoverable, no devices, an
    /// unwritable spec cache, or an unusable scratch directory.
    pub fn run(&self, selection: &Selection, params: &RunParameters) -> Result<RunReport> {
        fs::create_dir_all(&self.scratch_dir)?;
        let baseline = self.session.active_producer()?;
        let mut report = RunReport::default();
        let mut bindings: Vec<Binding> = Vec::new();

        for resolved in selection.files() {
            let (bound, warning) = params.bind(resolved.file);
            report.warnings.extend(warning);

            let index = if let Some(index) = bindings.iter().position(|b| b.params == bound) {
                index
            } else {
                let (set, producers) = self.build(&bound)?;
                let keys = report.configurations.append(set);
                bindings.push(Binding {
                    params: bound,
                    keys,
                    producers,
                });
                bindings.len() - 1
            };
            let Some(binding) = bindings.get(index) else {
                continue;
            };

            if binding.keys.is_empty() {
                warn!(file = resolved.file.name, "no configurations bound, skipping");
                continue;
            }

            for point in &resolved.points {
                for key in &binding.keys {
                    let Some(config) = report.configurations.get(key) else {
                        continue;
                    };
                    let result = self.execute(
                        resolved.file,
                        point,
                        config,
                        &binding.producers,
                        baseline.as_deref(),
                    )?;
                    report.results.push(result);
                }
            }
        }

        info!(
            results = report.results.len(),
            configurations = report.configurations.len(),
            "run complete"
        );
        Ok(report)
    }

    /// Configurations for one binding, plus every producer discovery returned for it.
    fn build(&self, bound: &FileParameters) -> Result<(ConfigurationSet, Vec<ProducerRef>)> {
        let builder = ConfigurationBuilder::new(self.session)
            .search_path(self.search_path.clone())
            .producers(bound.producers.clone())
            .device_ids(bound.device_ids.clone())
            .formats(bound.formats.clone())
            .spec_cache(self.spec_cache);
        let producers = builder.resolve_producers()?;
        let set = builder.build()?;
        let set = if bound.per_producer {
            set.first_per_producer()
        } else {
            set
        };
        Ok((set, producers))
    }

    fn execute(
        &self,
        file: &TestFile,
        point: &TestPoint,
        config: &TestConfiguration,
        producers: &[ProducerRef],
        baseline: Option<&Path>,
    ) -> Result<TestResult> {
        let test_name = format!("{}/{}", file.name, point.name);
        let _span = info_span!("point", test = %test_name, config = %config.key).entered();

        let ctx = PointContext::new(
            self.session,
            config,
            self.spec_cache,
            producers,
            self.timing,
            &self.scratch_dir,
        );
        let mut outcome = Outcome::from((point.run)(&ctx));

        let problems = self.verify_cleanup(&ctx, baseline)?;
        if !problems.is_empty() {
            let mut message = problems.join("; ");
            if let Outcome::Failed { message: original, .. } = &outcome {
                message = format!("{original}; {message}");
            }
            outcome = Outcome::Failed {
                kind: FailureKind::Cleanup,
                message,
            };
        }

        match &outcome {
            Outcome::Passed => info!(configuration = %config.label(), "passed"),
            Outcome::Incomplete { reason } => {
                info!(configuration = %config.label(), %reason, "incomplete");
            }
            Outcome::Failed { kind, message } => {
                error!(configuration = %config.label(), %kind, %message, "failed");
            }
        }

        Ok(TestResult {
            test_name,
            configuration_key: config.key.clone(),
            outcome,
        })
    }

    /// Check for, and undo, state a point left behind.
    fn verify_cleanup(
        &self,
        ctx: &PointContext<'_>,
        baseline: Option<&Path>,
    ) -> Result<Vec<String>> {
        let mut problems = Vec::new();

        let leaked = ctx.leaked_sessions();
        if leaked > 0 {
            problems.push(format!("{leaked} session(s) left open"));
        }

        let mut guard = self.session.acquire_current()?;
        let open = guard.open_session_count();
        if open > 0 {
            problems.push(format!("{open} session(s) still open after the point"));
        }
        let active = guard.active_producer();
        if active.as_deref() != baseline {
            problems.push(format!(
                "active producer left at {}",
                active
                    .as_deref()
                    .map_or_else(|| "<none>".to_owned(), |path| path.display().to_string())
            ));
            guard.set_active_producer(baseline)?;
        }
        guard.release()?;

        for entry in fs::read_dir(&self.scratch_dir)? {
            let path = entry?.path();
            problems.push(format!("temporary artifact {} left behind", path.display()));
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(err) = removed {
                warn!(path = %path.display(), error = %err, "failed to remove leftover artifact");
            }
        }

        if !problems.is_empty() {
            debug!(?problems, "cleanup problems");
        }
        Ok(problems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_single_file() {
        let selection = resolve(&["tVideoinput"]);
        assert_eq!(
            selection.names(),
            vec![("tVideoinput", vec!["verifyVideoinputObj", "verifySelectedSource"])]
        );
    }

    #[test]
    fn test_resolve_single_point() {
        let selection = resolve(&["tAcquisition/verifySnapshot"]);
        assert_eq!(selection.names(), vec![("tAcquisition", vec!["verifySnapshot"])]);
    }

    #[test]
    fn test_resolve_unknown_token_is_empty() {
        assert!(resolve(&["tFoo"]).is_empty());
        assert!(resolve(&["tAcquisition/verifyNothing"]).is_empty());
    }

    #[test]
    fn test_resolve_default_is_everything() {
        let none: [&str; 0] = [];
        let all = resolve(&none);
        assert_eq!(all.files().len(), REGISTRY.len());
        let points: usize = all.files().iter().map(|f| f.points.len()).sum();
        assert_eq!(points, 13);
        assert_eq!(resolve(&["ALL"]).names(), all.names());
    }

    #[test]
    fn test_resolve_merges_and_keeps_registry_order() {
        let selection = resolve(&[
            "tdevices/verifyalldevices",
            "TACQUISITION/verifyStreaming",
            "tAcquisition/verifySnapshot",
            "tDevices/verifyAllDevices",
        ]);
        assert_eq!(
            selection.names(),
            vec![
                ("tAcquisition", vec!["verifySnapshot", "verifyStreaming"]),
                ("tDevices", vec!["verifyAllDevices"]),
            ]
        );
    }

    #[test]
    fn test_bind_suppresses_unsupported_categories() {
        let params = RunParameters {
            producers: None,
            device_ids: Some(vec![1]),
            formats: Some(vec!["Mono8".to_owned()]),
        };
        let acquisition = &REGISTRY[1];
        let (bound, warning) = params.bind(acquisition);
        assert_eq!(bound.formats, FormatTesting::Disabled);
        assert_eq!(bound.device_ids, Some(vec![1]));
        let warning = warning.expect("format should be suppressed");
        assert_eq!(warning.suppressed, vec![Format]);

        let devices = &REGISTRY[4];
        let (bound, warning) = params.bind(devices);
        assert!(bound.per_producer);
        assert_eq!(bound.device_ids, None);
        assert_eq!(
            warning.map(|w| w.suppressed),
            Some(vec![Device, Format])
        );
    }

    #[test]
    fn test_bind_formats_file_always_expands() {
        let formats = &REGISTRY[3];
        let (bound, warning) = RunParameters::default().bind(formats);
        assert_eq!(bound.formats, FormatTesting::All);
        assert!(warning.is_none());

        let params = RunParameters {
            formats: Some(vec!["RGB8".to_owned()]),
            ..RunParameters::default()
        };
        let (bound, _) = params.bind(formats);
        assert_eq!(bound.formats, FormatTesting::Only(vec!["RGB8".to_owned()]));
    }

    #[test]
    fn test_outcome_mapping() {
        assert_eq!(Outcome::from(Ok(())), Outcome::Passed);
        assert!(matches!(
            Outcome::from(Err(PointError::AssumptionNotMet("no roi".to_owned()))),
            Outcome::Incomplete { .. }
        ));
        assert!(matches!(
            Outcome::from(Err(PointError::Timeout {
                what: "stream".to_owned(),
                after: std::time::Duration::from_secs(1),
            })),
            Outcome::Failed {
                kind: FailureKind::Timeout,
                ..
            }
        ));
    }
}
