pub mod buf_ext;
pub mod safe_converter;
