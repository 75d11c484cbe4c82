pub mod commands;
pub mod globalsettings;
