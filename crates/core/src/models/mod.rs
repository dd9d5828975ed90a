pub mod application_instance;
pub mod assignment;
pub mod family;
pub mod file;
pub mod grading_info;
pub mod grouping;
pub mod h_user;
pub mod lms;
pub mod lti_params;
pub mod lti_user;
pub mod oauth2_token;
