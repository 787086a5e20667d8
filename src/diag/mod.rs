//! Diagnostic engine: an enum kind plus ordered arguments per report

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Severity of a diagnostic. `Fatal` short-circuits the current phase;
/// `Error` lets the phase finish but blocks image emission.
pub enum Severity {
    /// Informational output requested by a trace option
    Note,
    /// The link continues and the image is written
    Warning,
    /// The link continues but no image is written
    Error,
    /// The current phase stops immediately
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
/// Every diagnostic the core can raise. Arguments are positional; the
/// template documents their order.
pub enum DiagKind {
    /// New symbol seen: name, origin path, attribute string
    AddNewSymbol,
    /// Symbol resolved against an existing entry: name, origin, attributes
    ResolveNewSymbol,
    /// Two non-weak definitions: name, first origin, second origin
    MultipleDefinition,
    /// Reference to an undefined symbol: name, file, section, offset
    UndefinedReference,
    /// Undefined reference with the enclosing function: name, file, section, function
    UndefinedReferenceInFunction,
    /// TLS symbol resolved against a non-TLS one: rendered description
    TlsNonTlsSymbolMismatch,
    /// A common symbol was overridden by a definition: name, common origin, define origin
    CommonOverriddenByDefine,
    /// Two commons merged: name, chosen size
    CommonChosen,
    /// Allocatable section matched no script rule: section, file
    UnrecognizedSection,
    /// Copy relocation refused under -z nocopyreloc: symbol, referencing file, defining file
    CopyRelocProhibited,
    /// Relocation type invalid in PIC output: reloc name, symbol, file
    InvalidRelocForPic,
    /// Relocation type the target cannot apply: reloc name, file
    UnsupportedReloc,
    /// Encoded relocation value does not fit its field: reloc name, symbol, place
    RelocOverflow,
    /// Relocation against a discarded section: symbol, section, file
    RelocAgainstDiscarded,
    /// --trace-reloc hit: reloc name, symbol, file
    TraceReloc,
    /// Trampoline created or reused for: symbol
    TrampolineSymbol,
    /// A fresh stub was cloned: stub symbol name
    CreateStub,
    /// An existing island satisfied the branch: stub symbol name
    ReuseStub,
    /// Section does not fit its MEMORY region: section, region
    SectionDoesNotFitRegion,
    /// Two MEMORY regions overlap: first, second
    OverlappingRegions,
    /// A script expression referenced an unknown symbol: expression text
    UnresolvableExpression,
    /// A reference prohibited by a cross-reference rule: from, to
    CrossReferenceProhibited,
    /// Undef with non-default visibility: name, visibility, file
    InvisibleReference,
    /// A shared library became needed to satisfy: symbol, library
    SharedLibraryNeeded,
    /// Erratum fix island inserted: section, offset
    ErratumFixApplied,
}

impl DiagKind {
    /// Default severity for this kind
    pub fn severity(self) -> Severity {
        use DiagKind::*;
        match self {
            AddNewSymbol | ResolveNewSymbol | TraceReloc | TrampolineSymbol | CreateStub
            | ReuseStub | CommonChosen | SharedLibraryNeeded | ErratumFixApplied => Severity::Note,
            CommonOverriddenByDefine | UnrecognizedSection => Severity::Warning,
            MultipleDefinition
            | UndefinedReference
            | UndefinedReferenceInFunction
            | CopyRelocProhibited
            | InvalidRelocForPic
            | UnsupportedReloc
            | RelocOverflow
            | RelocAgainstDiscarded
            | InvisibleReference
            | CrossReferenceProhibited => Severity::Error,
            TlsNonTlsSymbolMismatch
            | SectionDoesNotFitRegion
            | OverlappingRegions
            | UnresolvableExpression => Severity::Fatal,
        }
    }

    /// Message template; `{N}` is replaced with the N-th argument
    pub fn template(self) -> &'static str {
        use DiagKind::*;
        match self {
            AddNewSymbol => "Trace: adding symbol `{0}` from {1} {2}",
            ResolveNewSymbol => "Trace: resolving symbol `{0}` from {1} {2}",
            MultipleDefinition => "multiple definition of `{0}`; defined in {1} and in {2}",
            UndefinedReference => "undefined reference to `{0}` ({1}:{2}+{3})",
            UndefinedReferenceInFunction => {
                "undefined reference to `{0}` ({1}:{2}, in function `{3}`)"
            }
            TlsNonTlsSymbolMismatch => "{0}",
            CommonOverriddenByDefine => {
                "common symbol `{0}` in {1} is overridden by definition in {2}"
            }
            CommonChosen => "common symbol `{0}` resolved with size {1}",
            UnrecognizedSection => "section `{0}` from {1} matched no rule; placed in .unrecognized",
            CopyRelocProhibited => {
                "cannot copy-relocate `{0}` referenced from {1}, defined in {2}: -z nocopyreloc"
            }
            InvalidRelocForPic => "relocation {0} against `{1}` cannot be used in PIC output ({2})",
            UnsupportedReloc => "unsupported relocation type {0} in {1}",
            RelocOverflow => "relocation {0} against `{1}` out of range at 0x{2}",
            RelocAgainstDiscarded => "reference to `{0}` in discarded section {1} ({2})",
            TraceReloc => "Trace: relocation {0} against `{1}` in {2}",
            TrampolineSymbol => "trampoline used for call to `{0}`",
            CreateStub => "created stub `{0}`",
            ReuseStub => "reused stub `{0}`",
            SectionDoesNotFitRegion => "section {0} does not fit in region {1}",
            OverlappingRegions => "memory regions {0} and {1} overlap",
            UnresolvableExpression => "cannot evaluate script expression: {0}",
            CrossReferenceProhibited => "prohibited cross reference from {0} to {1}",
            InvisibleReference => "undefined {1} symbol `{0}` referenced from {2}",
            SharedLibraryNeeded => "symbol `{0}` makes {1} needed",
            ErratumFixApplied => "erratum 843419 fix applied in {0} at offset 0x{1}",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One recorded diagnostic
pub struct Diagnostic {
    /// What kind of report this is
    pub kind: DiagKind,
    /// Severity, normally `kind.severity()` but upgradable by callers
    pub severity: Severity,
    /// Ordered arguments substituted into the template
    pub args: Vec<String>,
}

impl Diagnostic {
    /// Render the template with the arguments substituted
    pub fn render(&self) -> String {
        let mut out = self.kind.template().to_string();
        for (i, arg) in self.args.iter().enumerate() {
            out = out.replace(&format!("{{{i}}}"), arg);
        }
        out
    }
}

#[derive(Debug, Default)]
struct EngineState {
    entries: Vec<Diagnostic>,
    seen: HashSet<String>,
    errors: usize,
    fatals: usize,
    warnings: usize,
}

#[derive(Debug, Default)]
/// Collects diagnostics raised by any phase. The counters feed the
/// module-level failure flag; entries are flushed by the embedder at phase
/// boundaries. Interior mutability lets parallel scan workers report
/// without holding the module mutably.
pub struct DiagnosticEngine {
    state: Mutex<EngineState>,
    warn_once: bool,
}

impl DiagnosticEngine {
    /// Create an engine; `warn_once` enables deduplication of repeated
    /// warnings keyed on the rendered text.
    pub fn new(warn_once: bool) -> Self {
        DiagnosticEngine {
            state: Mutex::new(EngineState::default()),
            warn_once,
        }
    }

    /// Raise a diagnostic with the kind's default severity
    pub fn raise<I, S>(&self, kind: DiagKind, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raise_with(kind, kind.severity(), args)
    }

    /// Raise with an explicit severity (e.g. a warning upgraded by
    /// `--fatal-warnings` handling in the embedder)
    pub fn raise_with<I, S>(&self, kind: DiagKind, severity: Severity, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let diag = Diagnostic {
            kind,
            severity,
            args: args.into_iter().map(Into::into).collect(),
        };
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if self.warn_once && severity == Severity::Warning {
            let rendered = diag.render();
            if !state.seen.insert(rendered) {
                return;
            }
        }
        match severity {
            Severity::Warning => state.warnings += 1,
            Severity::Error => state.errors += 1,
            Severity::Fatal => state.fatals += 1,
            Severity::Note => {}
        }
        log::debug!("diag: {}", diag.render());
        state.entries.push(diag);
    }

    /// Number of errors and fatal errors reported so far
    pub fn error_count(&self) -> usize {
        self.state.lock().map(|s| s.errors + s.fatals).unwrap_or(0)
    }

    /// Number of warnings reported so far
    pub fn warning_count(&self) -> usize {
        self.state.lock().map(|s| s.warnings).unwrap_or(0)
    }

    /// True once any fatal diagnostic was raised
    pub fn has_fatal(&self) -> bool {
        self.state.lock().map(|s| s.fatals > 0).unwrap_or(false)
    }

    /// Drain all recorded diagnostics, leaving the counters intact
    pub fn take(&self) -> Vec<Diagnostic> {
        self.state
            .lock()
            .map(|mut s| std::mem::take(&mut s.entries))
            .unwrap_or_default()
    }

    /// Snapshot the recorded diagnostics without draining them
    pub fn entries(&self) -> Vec<Diagnostic> {
        self.state
            .lock()
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// True if some recorded diagnostic is of `kind`
    pub fn contains(&self, kind: DiagKind) -> bool {
        self.state
            .lock()
            .map(|s| s.entries.iter().any(|d| d.kind == kind))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_in_order() {
        let d = Diagnostic {
            kind: DiagKind::MultipleDefinition,
            severity: Severity::Error,
            args: vec!["x".into(), "a.o".into(), "b.o".into()],
        };
        assert_eq!(
            d.render(),
            "multiple definition of `x`; defined in a.o and in b.o"
        );
    }

    #[test]
    fn warn_once_dedups_identical_warnings() {
        let engine = DiagnosticEngine::new(true);
        for _ in 0..3 {
            engine.raise(DiagKind::UnrecognizedSection, [".mine", "a.o"]);
        }
        engine.raise(DiagKind::UnrecognizedSection, [".other", "a.o"]);
        assert_eq!(engine.warning_count(), 2);
    }

    #[test]
    fn errors_and_fatals_count_separately() {
        let engine = DiagnosticEngine::new(false);
        engine.raise(DiagKind::UndefinedReference, ["f", "a.o", ".text", "0"]);
        assert_eq!(engine.error_count(), 1);
        assert!(!engine.has_fatal());
        engine.raise(DiagKind::TlsNonTlsSymbolMismatch, ["t: TLS mismatch"]);
        assert!(engine.has_fatal());
        assert_eq!(engine.error_count(), 2);
    }
}
