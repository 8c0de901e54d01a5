//! Result analyzer for agent output.
//!
//! Classifies the agent's final text (complete / error / needs-input),
//! extracts a next-phase hint with a confidence score, and scans for
//! referenced artifact paths. The path regex is deliberately loose; the
//! existence-on-disk check is the actual correctness gate, so a path that
//! does not resolve to a real file is silently dropped.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

static NEXT_PHASE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(?:下一阶段|next\s*phase|next\s*step)[：:]\s*([^\n]+)").unwrap(),
        Regex::new(r"(?i)(?:阶段目标|phase\s*goal|step\s*goal)[：:]\s*([^\n]+)").unwrap(),
        Regex::new(r"(?i)(?:继续|continue)[：:]\s*([^\n]+)").unwrap(),
        Regex::new(r"(?i)NEXT_PHASE:\s*([^\n]+)").unwrap(),
        Regex::new(r"(?i)NEXT_GOAL:\s*([^\n]+)").unwrap(),
    ]
});

static COMPLETION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(?:完成|completed|done|finished|success)").unwrap(),
        Regex::new(r"(?i)(?:任务结束|task\s+completed|task\s+done)").unwrap(),
        Regex::new(r"(?i)(?:没有下一阶段|no\s+next\s+phase|no\s+next\s+step)").unwrap(),
    ]
});

static ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(?:错误|error|failed|failure)").unwrap(),
        Regex::new(r"(?i)(?:异常|exception|crash)").unwrap(),
    ]
});

static INPUT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(?:请输入|please\s+input|enter\s+your)").unwrap(),
        Regex::new(r"(?i)(?:等待|waiting|awaiting)").unwrap(),
        Regex::new(r"\?$").unwrap(),
    ]
});

static CONTINUE_HINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)继续|下一步|next|continue").unwrap());

static FILE_PATH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:[a-zA-Z]:\\|/)?[\w\-\\/.]+\.\w+").unwrap());

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "ico", "tiff",
];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "aac", "ogg", "flac", "m4a", "opus"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "flv", "webm"];
const DOC_EXTENSIONS: &[&str] = &[
    "doc", "docx", "xls", "xlsx", "ppt", "pptx", "pdf", "txt", "csv", "md",
];

/// Result of analyzing agent output.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    /// Whether a follow-up phase was identified.
    pub can_continue: bool,
    /// The extracted next phase, if any.
    pub next_phase: Option<String>,
    /// Whether the output signals task completion.
    pub is_complete: bool,
    /// Whether the output signals an error.
    pub has_error: bool,
    /// Whether the output is waiting for user input.
    pub needs_input: bool,
    /// Confidence in the continuation hint, 0.0 - 1.0.
    pub confidence: f64,
    /// Image artifacts referenced by the output that exist on disk.
    pub image_files: Vec<String>,
    /// Audio artifacts referenced by the output that exist on disk.
    pub audio_files: Vec<String>,
    /// Video artifacts referenced by the output that exist on disk.
    pub video_files: Vec<String>,
    /// Document artifacts referenced by the output that exist on disk.
    pub doc_files: Vec<String>,
    /// All artifacts referenced by the output that exist on disk.
    pub all_files: Vec<String>,
}

/// Analyzes agent output for state and referenced artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAnalyzer;

impl ResultAnalyzer {
    /// Create a new analyzer.
    pub fn new() -> Self {
        Self
    }

    /// Analyze the agent's final text.
    pub fn analyze(&self, output: &str) -> AnalysisResult {
        let mut analysis = AnalysisResult::default();
        if output.is_empty() {
            return analysis;
        }

        analysis.is_complete = matches_any(&COMPLETION_PATTERNS, output);
        analysis.has_error = matches_any(&ERROR_PATTERNS, output);
        analysis.needs_input = matches_any(&INPUT_PATTERNS, output);

        if !analysis.is_complete
            && let Some(next_phase) = extract_next_phase(output)
        {
            analysis.confidence = calculate_confidence(output, &next_phase);
            analysis.next_phase = Some(next_phase);
            analysis.can_continue = true;
        }

        extract_files(output, &mut analysis);

        debug!(
            can_continue = analysis.can_continue,
            complete = analysis.is_complete,
            error = analysis.has_error,
            files = analysis.all_files.len(),
            confidence = analysis.confidence,
            "analyzed agent output"
        );

        analysis
    }
}

fn matches_any(patterns: &[Regex], output: &str) -> bool {
    patterns.iter().any(|p| p.is_match(output))
}

fn extract_next_phase(output: &str) -> Option<String> {
    for pattern in NEXT_PHASE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(output)
            && let Some(m) = caps.get(1)
        {
            let phase = m.as_str().trim();
            if !phase.is_empty() {
                return Some(phase.to_owned());
            }
        }
    }

    // Fallback: the last non-empty line, unless it reads as a
    // completion or error indicator.
    let last_line = output.lines().map(str::trim).filter(|l| !l.is_empty()).last()?;
    if matches_any(&COMPLETION_PATTERNS, last_line) || matches_any(&ERROR_PATTERNS, last_line) {
        return None;
    }
    Some(last_line.to_owned())
}

fn calculate_confidence(output: &str, next_phase: &str) -> f64 {
    let mut confidence: f64 = 0.0;

    if NEXT_PHASE_PATTERNS.iter().any(|p| p.is_match(output)) {
        confidence += 0.6;
    }
    if next_phase.chars().count() > 10 {
        confidence += 0.2;
    }
    if CONTINUE_HINT.is_match(output) {
        confidence += 0.2;
    }

    confidence.min(1.0)
}

fn extract_files(output: &str, analysis: &mut AnalysisResult) {
    let mut seen = HashSet::new();

    for m in FILE_PATH_PATTERN.find_iter(output) {
        let candidate = m.as_str();
        if !seen.insert(candidate.to_owned()) {
            continue;
        }

        let path = Path::new(candidate);
        if !path.is_file() {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        analysis.all_files.push(candidate.to_owned());
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            analysis.image_files.push(candidate.to_owned());
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            analysis.audio_files.push(candidate.to_owned());
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            analysis.video_files.push(candidate.to_owned());
        } else if DOC_EXTENSIONS.contains(&ext.as_str()) {
            analysis.doc_files.push(candidate.to_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_output_yields_default() {
        let analysis = ResultAnalyzer::new().analyze("");
        assert!(!analysis.can_continue);
        assert!(!analysis.is_complete);
        assert!(analysis.all_files.is_empty());
    }

    #[test]
    fn detects_completion() {
        let analysis = ResultAnalyzer::new().analyze("All tasks completed successfully.");
        assert!(analysis.is_complete);
        assert!(!analysis.can_continue);
    }

    #[test]
    fn detects_error() {
        let analysis = ResultAnalyzer::new().analyze("Build step crashed with an exception");
        assert!(analysis.has_error);
    }

    #[test]
    fn detects_needs_input() {
        let analysis = ResultAnalyzer::new().analyze("Please input the target branch");
        assert!(analysis.needs_input);
    }

    #[test]
    fn extracts_explicit_next_phase() {
        let analysis =
            ResultAnalyzer::new().analyze("Implemented the parser.\nNEXT_PHASE: write the codegen module");
        assert!(analysis.can_continue);
        assert_eq!(
            analysis.next_phase.as_deref(),
            Some("write the codegen module")
        );
        // Explicit marker (0.6) + long phase (0.2), no continue hint word
        // beyond the marker... "next" appears in NEXT_PHASE, so +0.2.
        assert!(analysis.confidence >= 0.8);
    }

    #[test]
    fn falls_back_to_last_line() {
        let analysis = ResultAnalyzer::new().analyze("working on it\nrefactor the bus");
        assert_eq!(analysis.next_phase.as_deref(), Some("refactor the bus"));
        assert!(analysis.confidence < 0.6);
    }

    #[test]
    fn no_phase_when_last_line_is_terminal() {
        let analysis = ResultAnalyzer::new().analyze("step one\neverything failed");
        assert!(analysis.next_phase.is_none());
        assert!(analysis.has_error);
    }

    #[test]
    fn only_existing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("out.png");
        std::fs::File::create(&real)
            .unwrap()
            .write_all(b"png")
            .unwrap();

        let output = format!(
            "Saved chart to {} and logs to /nonexistent/fake.txt",
            real.display()
        );
        let analysis = ResultAnalyzer::new().analyze(&output);

        assert_eq!(analysis.all_files, vec![real.display().to_string()]);
        assert_eq!(analysis.image_files.len(), 1);
        assert!(analysis.doc_files.is_empty());
    }

    #[test]
    fn files_categorized_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("voice.mp3");
        let doc = dir.path().join("report.pdf");
        std::fs::write(&audio, b"a").unwrap();
        std::fs::write(&doc, b"d").unwrap();

        let output = format!("{}\n{}", audio.display(), doc.display());
        let analysis = ResultAnalyzer::new().analyze(&output);

        assert_eq!(analysis.audio_files.len(), 1);
        assert_eq!(analysis.doc_files.len(), 1);
        assert_eq!(analysis.all_files.len(), 2);
    }

    #[test]
    fn duplicate_paths_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("dup.txt");
        std::fs::write(&file, b"x").unwrap();

        let output = format!("{p}\nagain {p}", p = file.display());
        let analysis = ResultAnalyzer::new().analyze(&output);
        assert_eq!(analysis.all_files.len(), 1);
    }
}
