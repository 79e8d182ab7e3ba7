use coap_lite::RequestType;

/// Hashable stand-in for [`RequestType`] used as half of a binding's uniqueness key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestTypeKey(usize);

impl From<RequestType> for RequestTypeKey {
    fn from(t: RequestType) -> Self {
        Self(match t {
            RequestType::Get => 1,
            RequestType::Post => 2,
            RequestType::Put => 3,
            RequestType::Delete => 4,
            RequestType::Fetch => 5,
            RequestType::Patch => 6,
            RequestType::IPatch => 7,
            _ => 0,
        })
    }
}

/// Parses an HTTP-style method name, case-insensitively.
pub fn parse_method(name: &str) -> Option<RequestType> {
    match name.trim().to_ascii_uppercase().as_str() {
        "GET" => Some(RequestType::Get),
        "POST" => Some(RequestType::Post),
        "PUT" => Some(RequestType::Put),
        "DELETE" => Some(RequestType::Delete),
        "FETCH" => Some(RequestType::Fetch),
        "PATCH" => Some(RequestType::Patch),
        "IPATCH" => Some(RequestType::IPatch),
        _ => None,
    }
}

pub fn method_name(method: RequestType) -> &'static str {
    match method {
        RequestType::Get => "GET",
        RequestType::Post => "POST",
        RequestType::Put => "PUT",
        RequestType::Delete => "DELETE",
        RequestType::Fetch => "FETCH",
        RequestType::Patch => "PATCH",
        RequestType::IPatch => "IPATCH",
        _ => "UNKNOWN",
    }
}
