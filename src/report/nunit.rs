//! NUnit report merging for the v2 and v3 formats.
//!
//! | Version | Root | Removed cases | Root counters |
//! |---------|------|---------------|---------------|
//! | v2 | `<test-results>` | `result="Ignored"` / `result="Skipped"` | total, errors, failures, not-run, inconclusive, ignored, skipped, invalid |
//! | v3 | `<test-run>` | `result="Skipped"` | testcasecount, total, passed, failed, inconclusive, skipped, asserts |
//!
//! Suites are appended under the first report's root without matching by
//! name. A merge never mixes versions.

use std::sync::LazyLock;

use regex::Regex;

use super::xml::{Counter, XmlDocument, XmlElement, XmlNode};
use super::{ReportDialect, ReportError, ReportMerger, ReportResult};

static FILE_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*)[_-]nunit[_-]report").expect("static pattern"));

const V2_COUNTERS: [Counter; 8] = [
    Counter::Total,
    Counter::Errors,
    Counter::Failures,
    Counter::NotRun,
    Counter::Inconclusive,
    Counter::Ignored,
    Counter::Skipped,
    Counter::Invalid,
];

const V3_COUNTERS: [Counter; 7] = [
    Counter::TestCaseCount,
    Counter::Total,
    Counter::Passed,
    Counter::Failed,
    Counter::Inconclusive,
    Counter::Skipped,
    Counter::Asserts,
];

/// NUnit result file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NUnitVersion {
    V2,
    V3,
}

impl NUnitVersion {
    /// Detects the format from the root element.
    pub fn detect(document: &XmlDocument) -> ReportResult<Self> {
        match document.root.name.as_str() {
            "test-results" => Ok(NUnitVersion::V2),
            "test-run" => Ok(NUnitVersion::V3),
            other => Err(ReportError::UnknownFormat {
                dialect: "NUnit",
                root: other.to_string(),
            }),
        }
    }

    fn root_counters(&self) -> &'static [Counter] {
        match self {
            NUnitVersion::V2 => &V2_COUNTERS,
            NUnitVersion::V3 => &V3_COUNTERS,
        }
    }
}

/// Merger for `nunit_xml_zip` archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct NUnitMerger;

impl NUnitMerger {
    pub fn new() -> Self {
        Self
    }
}

impl ReportMerger for NUnitMerger {
    fn dialect(&self) -> ReportDialect {
        ReportDialect::NUnit
    }

    fn file_name_pattern(&self) -> &Regex {
        &FILE_NAME_PATTERN
    }

    fn empty_document(&self) -> Option<XmlDocument> {
        None
    }

    fn transform(&self, document: &mut XmlDocument, suffix: &str) -> ReportResult<()> {
        let version = NUnitVersion::detect(document)?;
        let root = &mut document.root;

        rename_test_cases(root, suffix);
        match version {
            NUnitVersion::V2 => remove_v2_ignored(root),
            NUnitVersion::V3 => remove_v3_skipped(root),
        }
        root.prune_without("test-suite", "test-case");
        Ok(())
    }

    fn combine(
        &self,
        accumulator: Option<XmlDocument>,
        mut document: XmlDocument,
    ) -> ReportResult<XmlDocument> {
        let version = NUnitVersion::detect(&document)?;
        let Some(mut accumulator) = accumulator else {
            return Ok(document);
        };
        if NUnitVersion::detect(&accumulator)? != version {
            return Err(ReportError::MixedNUnitVersions);
        }

        for counter in version.root_counters() {
            accumulator.root.add_counter_from(&document.root, *counter);
        }
        accumulator.root.children.extend(
            document
                .root
                .drain_children("test-suite")
                .into_iter()
                .map(XmlNode::Element),
        );
        Ok(accumulator)
    }
}

fn rename_test_cases(element: &mut XmlElement, suffix: &str) {
    if element.name == "test-case"
        && let Some(name) = element.attr("name")
    {
        let renamed = format!("{name}{suffix}");
        element.set_attr("name", renamed);
    }
    for child in element.elements_mut() {
        rename_test_cases(child, suffix);
    }
}

fn has_result(test_case: &XmlElement, results: &[&str]) -> bool {
    test_case
        .attr("result")
        .is_some_and(|result| results.contains(&result))
}

/// v2 counts ignored cases under both `ignored` and `not-run`, and skipped
/// cases under both `skipped` and `not-run`.
fn remove_v2_ignored(root: &mut XmlElement) {
    root.remove_elements(
        "test-case",
        &|case: &XmlElement| has_result(case, &["Ignored", "Skipped"]),
        &mut |owner: &mut XmlElement, removed: &[XmlElement]| {
            let ignored = removed
                .iter()
                .filter(|case| has_result(case, &["Ignored"]))
                .count() as f64;
            let skipped = removed.len() as f64 - ignored;
            owner.decrement(Counter::Ignored, ignored);
            owner.decrement(Counter::Skipped, skipped);
            owner.decrement(Counter::NotRun, ignored + skipped);
        },
    );
}

fn remove_v3_skipped(root: &mut XmlElement) {
    root.remove_elements(
        "test-case",
        &|case: &XmlElement| has_result(case, &["Skipped"]),
        &mut |owner: &mut XmlElement, removed: &[XmlElement]| {
            let count = removed.len() as f64;
            owner.decrement(Counter::Skipped, count);
            owner.decrement(Counter::Total, count);
            owner.decrement(Counter::TestCaseCount, count);
        },
    );
}
