//! Response behaviors.
//!
//! Behaviors post-process a selected response in list order:
//!
//! - `wait` - latency before the response (fixed ms, range, or script)
//! - `decorate` - script that mutates or replaces the response
//! - `copy` - copy request values into response tokens
//! - `lookup` - substitute tokens from a CSV data source
//! - `repeat` - how many times a response is emitted before cycling
//!
//! `shellTransform` is recognized but refused: executing user-supplied
//! shell commands is out of bounds for this server.

mod copy;
mod cycler;
mod extraction;
mod lookup;
mod types;
mod wait;

pub use copy::{apply_copy, substitute_response, CopyBehavior, CopySource};
pub use cycler::ResponseCursor;
pub use extraction::{extract_jsonpath_all, extract_xpath_all, ExtractionMethod};
pub use lookup::{apply_lookup, CsvCache, CsvData, LookupBehavior};
pub use types::{parse_behaviors, Behavior, BehaviorList};
pub use wait::WaitBehavior;
