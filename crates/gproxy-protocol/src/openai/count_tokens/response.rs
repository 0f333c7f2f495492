use crate::openai::count_tokens::types::InputTokenCount;

pub type InputTokenCountResponse = InputTokenCount;
