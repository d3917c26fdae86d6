//! JUnit report merging.
//!
//! Per-device JUnit files look like:
//!
//! ```xml
//! <testsuites>
//!   <testsuite name="LoginTests" tests="3" failures="0" errors="0" skipped="1" time="72.079">
//!     <testcase name="signs_in" time="12.5"/>
//!     <testcase name="remembers_user" time="47.273"><skipped/></testcase>
//!     <testcase name="signs_out" time="12.306"/>
//!   </testsuite>
//! </testsuites>
//! ```
//!
//! Suites with the same `name` from different devices collapse into one
//! suite whose counters are the sum of the parts.

use std::sync::LazyLock;

use regex::Regex;

use super::xml::{Counter, XmlDocument, XmlElement, XmlNode};
use super::{ReportDialect, ReportError, ReportMerger, ReportResult};

static FILE_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*)_TEST.*").expect("static pattern"));

/// Counters summed when suites are combined.
const SUITE_COUNTERS: [Counter; 5] = [
    Counter::Tests,
    Counter::Failures,
    Counter::Time,
    Counter::Errors,
    Counter::Skipped,
];

/// Merger for `junit_xml_zip` archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct JUnitMerger;

impl JUnitMerger {
    pub fn new() -> Self {
        Self
    }

    /// Takes the suites out of a report, accepting both a `<testsuites>`
    /// wrapper and a bare `<testsuite>` root.
    fn take_suites(document: XmlDocument) -> ReportResult<Vec<XmlElement>> {
        let mut root = document.root;
        match root.name.as_str() {
            "testsuite" => Ok(vec![root]),
            "testsuites" => Ok(root.drain_children("testsuite")),
            _ => Err(ReportError::UnknownFormat {
                dialect: "JUnit",
                root: root.name,
            }),
        }
    }
}

/// `<testsuites>` with every counter at zero.
fn empty_testsuites() -> XmlDocument {
    let mut root = XmlElement::new("testsuites");
    for counter in SUITE_COUNTERS {
        root.set_counter(counter, 0.0);
    }
    XmlDocument::new(root)
}

fn combine_counters(target: &mut XmlElement, source: &XmlElement) {
    for counter in SUITE_COUNTERS {
        target.add_counter_from(source, counter);
    }
}

fn is_skipped(test_case: &XmlElement) -> bool {
    test_case.elements().any(|child| child.contains("skipped"))
}

impl ReportMerger for JUnitMerger {
    fn dialect(&self) -> ReportDialect {
        ReportDialect::JUnit
    }

    fn file_name_pattern(&self) -> &Regex {
        &FILE_NAME_PATTERN
    }

    fn empty_document(&self) -> Option<XmlDocument> {
        Some(empty_testsuites())
    }

    fn transform(&self, document: &mut XmlDocument, suffix: &str) -> ReportResult<()> {
        rename_test_cases(&mut document.root, suffix);

        document.root.remove_elements(
            "testcase",
            &is_skipped,
            &mut |owner: &mut XmlElement, removed: &[XmlElement]| {
                if owner.name != "testsuite" {
                    return;
                }
                let count = removed.len() as f64;
                let time: f64 = removed
                    .iter()
                    .filter_map(|case| case.counter(Counter::Time))
                    .sum();
                owner.decrement(Counter::Tests, count);
                owner.decrement(Counter::Skipped, count);
                owner.decrement(Counter::Time, time);
            },
        );
        Ok(())
    }

    fn combine(
        &self,
        accumulator: Option<XmlDocument>,
        document: XmlDocument,
    ) -> ReportResult<XmlDocument> {
        let mut accumulator = accumulator.unwrap_or_else(empty_testsuites);

        for mut suite in Self::take_suites(document)? {
            if !suite.contains("testcase") {
                continue;
            }

            combine_counters(&mut accumulator.root, &suite);

            let existing = match suite.attr("name") {
                Some(name) => accumulator.root.elements_mut().find(|candidate| {
                    candidate.name == "testsuite" && candidate.attr("name") == Some(name)
                }),
                None => None,
            };

            match existing {
                Some(existing) => {
                    combine_counters(existing, &suite);
                    existing.children.extend(
                        suite
                            .drain_children("testcase")
                            .into_iter()
                            .map(XmlNode::Element),
                    );
                }
                None => accumulator.root.children.push(XmlNode::Element(suite)),
            }
        }

        Ok(accumulator)
    }
}

fn rename_test_cases(element: &mut XmlElement, suffix: &str) {
    if element.name == "testcase"
        && let Some(name) = element.attr("name")
    {
        let renamed = format!("{name}{suffix}");
        element.set_attr("name", renamed);
    }
    for child in element.elements_mut() {
        rename_test_cases(child, suffix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::archive::tests::write_archive;
    use tempfile::TempDir;

    const LOGIN_SUITE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites>
  <testsuite name="LoginTests" tests="3" failures="0" errors="0" skipped="1" time="72.079">
    <testcase name="signs_in" time="12.5"/>
    <testcase name="remembers_user" time="47.273"><skipped/></testcase>
    <testcase name="signs_out" time="12.306"/>
  </testsuite>
</testsuites>"#;

    #[test]
    fn test_device_name_from_path() {
        let merger = JUnitMerger::new();
        assert_eq!(merger.device_name("pixel.8.api34_TEST-LoginTests.xml"), "pixel_8_api34");
        assert_eq!(merger.device_name("results.xml"), "unknown");
    }

    #[test]
    fn test_skipped_case_is_removed_with_counters() {
        let merger = JUnitMerger::new();
        let mut document = XmlDocument::parse(
            r#"<testsuites><testsuite name="S" tests="2" skipped="1" time="72.079">
                 <testcase name="runs" time="24.806"/>
                 <testcase name="skips" time="47.273"><skipped message="disabled"/></testcase>
               </testsuite></testsuites>"#,
        )
        .unwrap();

        merger.transform(&mut document, "_device").unwrap();

        let suite = document.root.elements().next().unwrap();
        assert_eq!(suite.attr("tests"), Some("1"));
        assert_eq!(suite.attr("skipped"), Some("0"));
        assert_eq!(suite.attr("time"), Some("24.806"));
        let cases = suite.collect_all("testcase");
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].attr("name"), Some("runs_device"));
    }

    #[test]
    fn test_same_suite_from_two_devices_is_merged() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("junit_xml_zip.zip");
        write_archive(
            &archive,
            &[
                ("pixel_TEST-LoginTests.xml", LOGIN_SUITE),
                ("iphone.15_TEST-LoginTests.xml", LOGIN_SUITE),
            ],
        );

        let merged = JUnitMerger::new().merge_xml_results(&archive).unwrap();

        let suites: Vec<&XmlElement> = merged.root.elements().collect();
        assert_eq!(suites.len(), 1);
        let suite = suites[0];
        assert_eq!(suite.attr("tests"), Some("4"));
        assert_eq!(suite.attr("skipped"), Some("0"));
        assert_eq!(suite.attr("time"), Some("49.612"));
        assert_eq!(suite.collect_all("testcase").len(), 4);

        assert_eq!(merged.root.attr("tests"), Some("4"));
        assert_eq!(merged.root.attr("skipped"), Some("0"));
        assert_eq!(merged.root.attr("failures"), Some("0"));

        let names: Vec<&str> = suite
            .collect_all("testcase")
            .iter()
            .filter_map(|case| case.attr("name"))
            .collect();
        assert_eq!(
            names,
            vec![
                "signs_in_pixel",
                "signs_out_pixel",
                "signs_in_iphone_15",
                "signs_out_iphone_15"
            ]
        );
    }

    #[test]
    fn test_distinct_suites_are_appended() {
        let merger = JUnitMerger::new();
        let first = XmlDocument::parse(
            r#"<testsuite name="A" tests="1" failures="1" errors="0" skipped="0" time="1"><testcase name="a"/></testsuite>"#,
        )
        .unwrap();
        let second = XmlDocument::parse(
            r#"<testsuites><testsuite name="B" tests="2" failures="0" errors="1" skipped="0" time="2.25"><testcase name="b"/><testcase name="c"/></testsuite></testsuites>"#,
        )
        .unwrap();

        let merged = merger.combine(None, first).unwrap();
        let merged = merger.combine(Some(merged), second).unwrap();

        assert_eq!(merged.root.elements().count(), 2);
        assert_eq!(merged.root.attr("tests"), Some("3"));
        assert_eq!(merged.root.attr("failures"), Some("1"));
        assert_eq!(merged.root.attr("errors"), Some("1"));
        assert_eq!(merged.root.attr("time"), Some("3.25"));
    }

    #[test]
    fn test_suite_without_cases_is_dropped() {
        let merger = JUnitMerger::new();
        let mut document = XmlDocument::parse(
            r#"<testsuites><testsuite name="OnlySkipped" tests="1" skipped="1" time="3"><testcase name="x" time="3"><skipped/></testcase></testsuite></testsuites>"#,
        )
        .unwrap();
        merger.transform(&mut document, "_d").unwrap();

        let merged = merger.combine(merger.empty_document(), document).unwrap();
        assert_eq!(merged.root.elements().count(), 0);
        assert_eq!(merged.root.attr("tests"), Some("0"));
    }

    #[test]
    fn test_empty_archive_gives_empty_document() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("junit_xml_zip.zip");
        write_archive(&archive, &[("reports/", "")]);

        let merged = JUnitMerger::new().merge_xml_results(&archive).unwrap();
        assert_eq!(merged.root.name, "testsuites");
        assert_eq!(merged.root.attr("time"), Some("0"));
        assert_eq!(merged.root.elements().count(), 0);
    }

    #[test]
    fn test_unknown_root_is_rejected() {
        let merger = JUnitMerger::new();
        let document = XmlDocument::parse("<test-run/>").unwrap();
        assert!(matches!(
            merger.combine(None, document),
            Err(ReportError::UnknownFormat { dialect: "JUnit", .. })
        ));
    }
}
