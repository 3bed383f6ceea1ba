//! Step-recording assertions for proxyhop tests.
//!
//! A [`TestReport`] records the setup, actions and assertions of one test.
//! When `TEST_REPORT_DIR` is set, each report is written there as a text file
//! on drop, so a run can be reviewed as a readable narrative.

use std::fmt::{Debug, Display};
use std::path::PathBuf;
use std::sync::Mutex;

/// Start a report named after the enclosing test function.
///
/// Works in sync and async tests.
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let name = &name[..name.len() - 3];
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::TestReport::new(name, $title, file!(), line!())
    }};
}

enum Step {
    Setup(String),
    Action(String),
    Pass(String),
    Fail(String),
}

impl Step {
    fn line(&self) -> String {
        match self {
            Step::Setup(msg) => format!("SETUP  {}", msg),
            Step::Action(msg) => format!("ACTION {}", msg),
            Step::Pass(msg) => format!("PASS   {}", msg),
            Step::Fail(msg) => format!("FAIL   {}", msg),
        }
    }
}

pub struct TestReport {
    path: String,
    title: String,
    location: String,
    steps: Mutex<Vec<Step>>,
    report_dir: Option<PathBuf>,
}

impl TestReport {
    pub fn new(path: &str, title: &str, file: &str, line: u32) -> Self {
        Self {
            path: path.to_string(),
            title: title.to_string(),
            location: format!("{}:{}", file, line),
            steps: Mutex::new(Vec::new()),
            report_dir: std::env::var_os("TEST_REPORT_DIR").map(PathBuf::from),
        }
    }

    fn record(&self, step: Step) {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(step);
    }

    /// Debug rendering, shortened so a large body does not swamp the report
    fn shown(value: &impl Debug) -> String {
        let text = format!("{:?}", value);
        match text.char_indices().nth(300) {
            Some((cut, _)) => format!("`{}…`", &text[..cut]),
            None => format!("`{}`", text),
        }
    }

    pub fn setup(&self, msg: impl Display) {
        self.record(Step::Setup(msg.to_string()));
    }

    pub fn action(&self, msg: impl Display) {
        self.record(Step::Action(msg.to_string()));
    }

    fn check(&self, pass: bool, msg: String) {
        self.record(if pass { Step::Pass(msg) } else { Step::Fail(msg) });
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let pass = actual == expected;
        self.check(
            pass,
            format!("{}: {} == {}", label, Self::shown(actual), Self::shown(expected)),
        );
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let pass = haystack.contains(needle);
        self.check(
            pass,
            format!("{}: {} contains {}", label, Self::shown(&haystack), Self::shown(&needle)),
        );
        assert!(pass, "{}: {:?} does not contain {:?}", label, haystack, needle);
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        self.check(value, format!("{}: `{}`", label, value));
        assert!(value, "{}", label);
    }

    fn write(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };
        let result = if std::thread::panicking() { "fail" } else { "pass" };

        let mut lines = vec![
            format!("TEST   {}", self.path),
            format!("TITLE  {}", self.title),
            format!("SOURCE {}", self.location),
        ];
        let steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        lines.extend(steps.iter().map(Step::line));
        lines.push(format!("RESULT {}", result));
        lines.push(String::new());

        let file = dir.join(format!("{}.txt", self.path.replace("::", "__")));
        let _ = std::fs::create_dir_all(dir);
        let _ = std::fs::write(file, lines.join("\n"));
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write();
    }
}
