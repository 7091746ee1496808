mod code;
mod finding;
mod report;

pub use code::{Code, MAX_CODE_LEN, RULE_ERROR};
pub use finding::{Finding, Issue, Severity, Status};
pub use report::{Report, ReportDocument};
