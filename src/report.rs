//! Test report handling
//!
//! Each run collects its measurements into a [TestRecord]. Once the board passed, the record is
//! appended as a single line to a CSV report which lives in a git repository, and committed.
//! Git failures never fail a test run, they are only logged.

use std::{
    fmt,
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, error, info};

/// Separator between fields of a report line
pub const FIELD_SEPARATOR: &str = ", ";

/// Ordered measurements of a single test run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRecord {
    fields: Vec<String>,
}

impl TestRecord {
    /// Creates an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a measurement to the record
    pub fn push<T: ToString>(&mut self, value: T) {
        self.fields.push(value.to_string())
    }

    /// Returns the recorded fields in order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Number of recorded fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Formats the record as a newline terminated CSV line
    pub fn to_csv_line(&self) -> String {
        let mut line = self.fields.join(FIELD_SEPARATOR);
        line.push('\n');
        line
    }

    /// Appends the record to the file at `path`, creating it if needed.
    /// Existing lines are never touched
    pub fn append_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        f.write_all(self.to_csv_line().as_bytes())?;
        f.flush()
    }
}

impl fmt::Display for TestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fields.join(FIELD_SEPARATOR))
    }
}

/// Git repository holding the CSV test report
#[derive(Debug, Clone)]
pub struct ReportRepository {
    directory: PathBuf,
    file_name: String,
    product_name: String,
    use_git: bool,
}

impl ReportRepository {
    /// Creates a report repository.
    ///
    /// ## Parameters
    /// * directory - Working tree of the report repository
    /// * file_name - Name of the CSV report inside `directory`
    /// * product_name - Product name used in commit messages, EG: 'EVSE Bricklet 2.0'
    /// * use_git - If false, the report is only written, never pulled, committed or pushed
    pub fn new<P: Into<PathBuf>>(directory: P, file_name: &str, product_name: &str, use_git: bool) -> Self {
        Self {
            directory: directory.into(),
            file_name: file_name.into(),
            product_name: product_name.into(),
            use_git,
        }
    }

    /// Full path of the CSV report
    pub fn report_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    /// Commit message for a test report of the device with `uid`
    pub fn commit_message(&self, uid: &str) -> String {
        format!("Add test report for {} with UID {uid}", self.product_name)
    }

    /// Pulls the latest report. Failures are logged
    pub fn pull(&self) {
        if self.use_git {
            self.run_git(&["pull"]);
        }
    }

    /// Appends `record` to the report
    pub fn write(&self, record: &TestRecord) -> io::Result<()> {
        let path = self.report_path();
        info!("Writing test report line to {}", path.display());
        record.append_to(path)
    }

    /// Pulls, commits the report for the device with `uid` and pushes it.
    /// Failures are logged and otherwise ignored
    pub fn commit_and_push(&self, uid: &str) {
        if !self.use_git {
            return;
        }
        self.pull();
        let msg = self.commit_message(uid);
        self.run_git(&["commit", &self.file_name, "-m", &msg]);
        self.run_git(&["push"]);
    }

    fn run_git(&self, args: &[&str]) -> bool {
        debug!("Running git {args:?} in {}", self.directory.display());
        match Command::new("git").args(args).current_dir(&self.directory).output() {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                if out.status.success() {
                    println!("   -> git {}", args.join(" "));
                    println!("      {}", text.trim());
                    true
                } else {
                    error!("git {} failed:\n{}", args[0], text.trim());
                    false
                }
            }
            Err(e) => {
                error!("git {} failed:\n{e}", args[0]);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("evse_tester_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_csv_line() {
        let mut r = TestRecord::new();
        r.push("Xyz");
        r.push(4294967295u32);
        r.push(2712);
        r.push(-10302);
        assert_eq!(r.len(), 4);
        let line = r.to_csv_line();
        assert_eq!(line, "Xyz, 4294967295, 2712, -10302\n");
        assert_eq!(line.trim_end().split(FIELD_SEPARATOR).count(), 4);
    }

    #[test]
    fn test_empty_record() {
        let r = TestRecord::new();
        assert!(r.is_empty());
        assert_eq!(r.to_csv_line(), "\n");
    }

    #[test]
    fn test_append_keeps_previous_lines() {
        let dir = temp_dir("append");
        let path = dir.join("full_test_log.csv");
        fs::write(&path, "old, 1, 2\n").unwrap();

        let mut r = TestRecord::new();
        r.push("abc");
        r.push(880);
        r.append_to(&path).unwrap();
        r.append_to(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "old, 1, 2\nabc, 880\nabc, 880\n");
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_repository_without_git() {
        let dir = temp_dir("repo");
        let repo = ReportRepository::new(&dir, "log.csv", "EVSE Bricklet 3.0", false);
        assert_eq!(repo.commit_message("2xYz"), "Add test report for EVSE Bricklet 3.0 with UID 2xYz");

        let mut r = TestRecord::new();
        r.push("2xYz");
        repo.pull();
        repo.write(&r).unwrap();
        repo.commit_and_push("2xYz");
        assert_eq!(fs::read_to_string(repo.report_path()).unwrap(), "2xYz\n");
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_git_failure_is_not_fatal() {
        // Not a git repository, every git call fails but nothing panics
        let dir = temp_dir("nogit");
        let repo = ReportRepository::new(&dir, "log.csv", "EVSE Bricklet 2.0", true);
        assert!(!repo.run_git(&["push"]));
        repo.commit_and_push("abc");
        fs::remove_dir_all(dir).unwrap();
    }
}
