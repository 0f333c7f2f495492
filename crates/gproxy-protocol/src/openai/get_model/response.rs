use crate::openai::get_model::types::Model;

pub type GetModelResponse = Model;
