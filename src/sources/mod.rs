//! External collaborators: the link-risk classifier, registration data and
//! threat lists.

pub mod classifier;
pub mod rate_limiter;
pub mod threat_list;
pub mod whois;
