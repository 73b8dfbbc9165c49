//! Common imports for streaming a report and consuming its events.
pub use crate::{
    AbortHandle, Assembler, AssemblyEvent, AssemblyOutcome, AssemblyStream, ClientConfig,
    HttpReportSource, Message, ReportRequest, ReportSource, Role, StreamError, StreamFailure,
    StreamState, Transcript,
};
