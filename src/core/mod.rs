pub mod credential_format;
pub mod dcql_query;
pub mod holder_binding;
pub mod presentation_definition;
pub mod presentation_submission;
pub mod transaction_data;
pub mod util;
