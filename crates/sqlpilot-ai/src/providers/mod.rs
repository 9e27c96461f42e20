mod common;
mod openai_completions;

pub(crate) use common::{is_loopback_base_url, now_millis};
pub(crate) use openai_completions::run_openai_completions;
