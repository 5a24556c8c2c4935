use serde::Deserialize;

#[derive(Deserialize)]
pub(crate) struct AuthorizeParams {
    pub(crate) state: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct CallbackParams {
    pub(crate) code: Option<String>,
    pub(crate) state: Option<String>,
    pub(crate) error: Option<String>,
    pub(crate) error_description: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct LoginForm {
    #[serde(default)]
    pub(crate) username: String,
    #[serde(default)]
    pub(crate) password: String,
}

#[derive(Deserialize)]
pub(crate) struct LogoutParams {
    pub(crate) redirect: Option<String>,
}
