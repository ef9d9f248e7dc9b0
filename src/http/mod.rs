pub(crate) mod cache_busting;
pub(crate) mod gateway;
pub(crate) mod location;
pub(crate) mod origin;
pub(crate) mod simulate;
