//! Build failure diagnosis
//!
//! First-match-wins over the priority-ordered catalog, a per-kind detail
//! extractor, generated fixes, and two optional enrichments: an advisory
//! query for low-confidence results and history-biased fix ordering.

pub mod catalog;
pub mod extract;

pub use catalog::{Catalog, CompiledPattern, ErrorKind, ErrorPattern, Matcher, BUILTIN_PATTERNS};
pub use extract::{extract_detail, normalized_error_line, signature};

use crate::collab::Advisor;
use crate::fix::{solutions, FixAction};
use crate::history::FixHistory;
use crate::project::ProjectContext;
use crate::util::truncate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Below this confidence an attached advisor is consulted.
pub const ADVISORY_THRESHOLD: f64 = 0.6;
/// Confidence added by a successful advisory answer.
pub const ADVISORY_BOOST: f64 = 0.3;

const ADVISORY_MAX_INPUT: usize = 4000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDiagnosis {
    pub kind: ErrorKind,
    /// The build output exactly as given.
    pub error_text: String,
    pub diagnosis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub signature: String,
    pub confidence: f64,
    pub fixes: Vec<FixAction>,
    /// An advisor contributed to `diagnosis`.
    #[serde(default)]
    pub advised: bool,
    /// `fixes[0]` came from the fix history.
    #[serde(default)]
    pub from_history: bool,
}

impl ErrorDiagnosis {
    pub fn is_unknown(&self) -> bool {
        self.kind == ErrorKind::Unknown
    }
}

pub fn confidence_for_priority(priority: u8) -> f64 {
    (priority as f64 / 10.0).min(1.0)
}

pub struct Diagnoser<'a> {
    catalog: &'a Catalog,
    advisor: Option<&'a dyn Advisor>,
    history: Option<&'a FixHistory>,
}

impl<'a> Diagnoser<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            advisor: None,
            history: None,
        }
    }

    pub fn with_advisor(mut self, advisor: &'a dyn Advisor) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_history(mut self, history: &'a FixHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn diagnose(&self, text: &str, project: Option<&ProjectContext>) -> ErrorDiagnosis {
        let mut diagnosis = match self.catalog.first_match(text) {
            Some(hit) => {
                let kind = hit.pattern.kind;
                let detail = extract_detail(kind, hit.capture(text));
                let prose = match &detail {
                    Some(detail) => format!("{}: {}", hit.pattern.description, detail),
                    None => hit.pattern.description.to_string(),
                };
                ErrorDiagnosis {
                    kind,
                    error_text: text.to_string(),
                    diagnosis: prose,
                    signature: signature(kind, detail.as_deref(), text),
                    confidence: confidence_for_priority(hit.pattern.priority),
                    fixes: solutions::generate(kind, detail.as_deref(), project),
                    detail,
                    advised: false,
                    from_history: false,
                }
            }
            None => ErrorDiagnosis {
                kind: ErrorKind::Unknown,
                error_text: text.to_string(),
                diagnosis: "Unrecognized build failure".to_string(),
                detail: None,
                signature: signature(ErrorKind::Unknown, None, text),
                confidence: 0.0,
                fixes: solutions::generate(ErrorKind::Unknown, None, project),
                advised: false,
                from_history: false,
            },
        };

        tracing::debug!(
            kind = %diagnosis.kind,
            signature = %diagnosis.signature,
            confidence = diagnosis.confidence,
            "diagnosed build failure"
        );

        if let Some(advisor) = self.advisor {
            if diagnosis.confidence < ADVISORY_THRESHOLD || diagnosis.is_unknown() {
                self.consult(advisor, &mut diagnosis, project);
            }
        }

        if let Some(history) = self.history {
            apply_history_bias(history, &mut diagnosis);
        }

        diagnosis
    }

    /// Signature of every catalog pattern that hits anywhere in `text`.
    pub fn signatures(&self, text: &str) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self
            .catalog
            .all_matches(text)
            .into_iter()
            .map(|hit| {
                let kind = hit.pattern.kind;
                let detail = extract_detail(kind, hit.capture(text));
                signature(kind, detail.as_deref(), text)
            })
            .collect();
        if out.is_empty() && !text.trim().is_empty() {
            out.insert(signature(ErrorKind::Unknown, None, text));
        }
        out
    }

    fn consult(
        &self,
        advisor: &dyn Advisor,
        diagnosis: &mut ErrorDiagnosis,
        project: Option<&ProjectContext>,
    ) {
        let prompt = advisory_prompt(diagnosis, project);
        match advisor.query(&prompt) {
            Ok(answer) if !answer.trim().is_empty() => {
                diagnosis.diagnosis.push_str("\n\n");
                diagnosis.diagnosis.push_str(answer.trim());
                diagnosis.confidence = (diagnosis.confidence + ADVISORY_BOOST).min(1.0);
                diagnosis.advised = true;
            }
            Ok(_) => tracing::debug!("advisor returned an empty answer"),
            Err(err) => tracing::warn!(error = %err, "advisory query failed; continuing without it"),
        }
    }
}

fn advisory_prompt(diagnosis: &ErrorDiagnosis, project: Option<&ProjectContext>) -> String {
    let mut prompt = String::from(
        "A build failed. Explain the most likely cause in a few sentences and suggest a fix.\n",
    );
    if let Some(project) = project {
        prompt.push_str(&format!(
            "Language: {}\nBuild system: {}\n",
            project.language.name(),
            project.build_system.name()
        ));
    }
    if !diagnosis.is_unknown() {
        prompt.push_str(&format!("Preliminary diagnosis: {}\n", diagnosis.diagnosis));
    }
    prompt.push_str("\nBuild output:\n");
    prompt.push_str(&truncate(&diagnosis.error_text, ADVISORY_MAX_INPUT));
    prompt
}

fn apply_history_bias(history: &FixHistory, diagnosis: &mut ErrorDiagnosis) {
    let Some(best) = history.suggest(diagnosis) else {
        return;
    };
    tracing::debug!(fix = %best.kind, subject = best.subject(), "history suggests a known fix");
    diagnosis.fixes.retain(|fix| !fix.same_effect(&best));
    diagnosis.fixes.insert(0, best);
    diagnosis.from_history = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::CollabError;
    use crate::fix::FixKind;
    use std::cell::Cell;

    struct CannedAdvisor {
        answer: Option<&'static str>,
        calls: Cell<usize>,
    }

    impl CannedAdvisor {
        fn new(answer: Option<&'static str>) -> Self {
            Self {
                answer,
                calls: Cell::new(0),
            }
        }
    }

    impl Advisor for CannedAdvisor {
        fn query(&self, _prompt: &str) -> Result<String, CollabError> {
            self.calls.set(self.calls.get() + 1);
            self.answer
                .map(str::to_string)
                .ok_or_else(|| CollabError::Unavailable("offline".to_string()))
        }
    }

    #[test]
    fn test_sdl_undefined_reference_suggests_install() {
        let catalog = Catalog::builtin();
        let diag = Diagnoser::new(&catalog).diagnose("main.c:5: undefined reference to `SDL_Init'", None);
        assert!(matches!(
            diag.kind,
            ErrorKind::UndefinedReference | ErrorKind::MissingLibrary
        ));
        assert!(diag.confidence > 0.0);
        assert!(diag.fixes.iter().any(|f| f.kind == FixKind::InstallPackage));
    }

    #[test]
    fn test_sdl_missing_header() {
        let catalog = Catalog::builtin();
        let diag = Diagnoser::new(&catalog).diagnose(
            "main.c:1:10: fatal error: SDL2/SDL.h: No such file or directory",
            None,
        );
        assert_eq!(diag.kind, ErrorKind::MissingHeader);
        assert_eq!(diag.detail.as_deref(), Some("SDL2/SDL.h"));
        assert_eq!(diag.signature, "missing_header:sdl2/sdl.h");
        assert_eq!(diag.fixes[0].kind, FixKind::InstallPackage);
        assert_eq!(diag.confidence, 1.0);
    }

    #[test]
    fn test_cmake_too_old_lowers_to_running_version() {
        let catalog = Catalog::builtin();
        let log = "CMake Error at CMakeLists.txt:1 (cmake_minimum_required):\n  \
                   CMake 3.20 or higher is required.  You are running version 3.16.3\n\n\n\
                   -- Configuring incomplete, errors occurred!";
        let diag = Diagnoser::new(&catalog).diagnose(log, None);
        assert_eq!(diag.kind, ErrorKind::BuildConfigVersion);
        assert_eq!(diag.detail.as_deref(), Some("3.16.3"));
        assert_eq!(diag.fixes[0].kind, FixKind::FixBuildConfigVersion);
        assert_eq!(diag.fixes[0].value.as_deref(), Some("3.16.3"));
    }

    #[test]
    fn test_cmake_compatibility_raises_to_required_version() {
        let catalog = Catalog::builtin();
        let log = "CMake Error at CMakeLists.txt:1 (cmake_minimum_required):\n  \
                   Compatibility with CMake < 3.5 has been removed from CMake.";
        let diag = Diagnoser::new(&catalog).diagnose(log, None);
        assert_eq!(diag.kind, ErrorKind::BuildConfigVersion);
        assert_eq!(diag.detail.as_deref(), Some("3.5"));
    }

    #[test]
    fn test_cmake_requirement_without_running_version_has_no_version_fix() {
        let catalog = Catalog::builtin();
        let diag = Diagnoser::new(&catalog).diagnose("CMake 3.20 or higher is required", None);
        assert_eq!(diag.kind, ErrorKind::BuildConfigVersion);
        assert_eq!(diag.detail, None);
        assert!(diag.fixes.iter().all(|f| f.kind != FixKind::FixBuildConfigVersion));
    }

    #[test]
    fn test_priority_beats_position_in_text() {
        let catalog = Catalog::builtin();
        let text = "collect2: error: ld returned 1 exit status\n\
                    /usr/bin/ld: cannot find -lz";
        let diag = Diagnoser::new(&catalog).diagnose(text, None);
        assert_eq!(diag.kind, ErrorKind::MissingLibrary);
        assert_eq!(diag.detail.as_deref(), Some("z"));
    }

    #[test]
    fn test_unknown_has_zero_confidence_and_generic_fixes() {
        let catalog = Catalog::builtin();
        let diag = Diagnoser::new(&catalog).diagnose("something odd happened", None);
        assert_eq!(diag.kind, ErrorKind::Unknown);
        assert_eq!(diag.confidence, 0.0);
        assert!(!diag.fixes.is_empty());
        assert!(diag.signature.starts_with("unknown:"));
    }

    #[test]
    fn test_confidence_stays_in_unit_range() {
        let catalog = Catalog::builtin();
        for pattern in catalog.iter() {
            let c = confidence_for_priority(pattern.pattern.priority);
            assert!((0.0..=1.0).contains(&c));
        }
        assert_eq!(confidence_for_priority(250), 1.0);
    }

    #[test]
    fn test_advisor_enriches_low_confidence_only() {
        let catalog = Catalog::builtin();
        let advisor = CannedAdvisor::new(Some("Probably a typo."));
        let diagnoser = Diagnoser::new(&catalog).with_advisor(&advisor);

        let unknown = diagnoser.diagnose("weird failure", None);
        assert_eq!(unknown.kind, ErrorKind::Unknown);
        assert!(unknown.advised);
        assert!((unknown.confidence - 0.3).abs() < 1e-9);
        assert!(unknown.diagnosis.ends_with("Probably a typo."));

        let header = diagnoser.diagnose("fatal error: zlib.h: No such file or directory", None);
        assert!(!header.advised);
        assert_eq!(advisor.calls.get(), 1);
    }

    #[test]
    fn test_advisor_failure_is_skipped() {
        let catalog = Catalog::builtin();
        let advisor = CannedAdvisor::new(None);
        let diag = Diagnoser::new(&catalog)
            .with_advisor(&advisor)
            .diagnose("syntax error near line 3", None);
        assert_eq!(diag.kind, ErrorKind::SyntaxError);
        assert!(!diag.advised);
        assert!((diag.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_signatures_cover_every_hit() {
        let catalog = Catalog::builtin();
        let diagnoser = Diagnoser::new(&catalog);
        let sigs = diagnoser.signatures(
            "a.c:1:10: fatal error: zlib.h: No such file or directory\n\
             collect2: error: ld returned 1 exit status",
        );
        assert!(sigs.contains("missing_header:zlib.h"));
        assert!(sigs.contains("linker_error"));
        assert!(diagnoser.signatures("").is_empty());
    }
}
