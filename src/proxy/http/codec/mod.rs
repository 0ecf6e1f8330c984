mod body;
mod headers;
mod line;
mod request;
mod response;

pub(crate) use body::{BodyTooLarge, read_chunked_body, read_fixed_body, read_until_close};
pub(crate) use headers::{Http1HeaderLine, header_lines_to_map};
pub(crate) use request::{Http1RequestHead, read_http1_request_head};
pub(crate) use response::{
    BodyPlan, Http1ResponseHead, encode_proxied_response_head, read_http1_response_head,
};
