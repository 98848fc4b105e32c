//! Protocol-neutral request and response model.
//!
//! Every protocol server parses its wire format into a [`NeutralRequest`];
//! the matching engine and scripting sandbox only ever see this form.

mod request;
mod response;

pub use request::{
    header_to_title_case, parse_query_string, HttpRequest, NeutralRequest, SmtpRequest, TcpRequest,
};
pub use response::{IsResponse, ResolvedResponse, ResponseMode, StatusField};
