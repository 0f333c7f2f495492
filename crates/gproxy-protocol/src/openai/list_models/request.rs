/// `GET /v1/models` takes no parameters.
pub struct ListModelsRequest;
