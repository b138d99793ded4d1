pub mod admin;
pub mod audit;
pub mod audit_logs;
pub mod auth;
pub mod bans;
pub mod bots;
pub mod channels;
pub mod commands;
pub mod dms;
pub mod federation;
pub mod files;
pub mod guilds;
pub mod interactions;
pub mod invites;
pub mod livekit_proxy;
pub mod members;
pub mod realtime;
pub mod relationships;
pub mod roles;
pub mod security;
pub mod users;
pub mod voice;
pub mod voice_v2;
