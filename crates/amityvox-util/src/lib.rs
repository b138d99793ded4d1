pub mod at_rest;
pub mod pagination;
pub mod snowflake;
pub mod ulid;
pub mod validation;
