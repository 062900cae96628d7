pub(crate) mod cluster;

pub(crate) mod fixtures;

pub(crate) mod logging;

pub(crate) mod media;

pub(crate) mod mem_db;

pub(crate) mod network;

pub(crate) mod registry;
