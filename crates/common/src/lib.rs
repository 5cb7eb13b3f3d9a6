// modelsync-common: wire types shared by the daemon and the client

pub mod protocol;
pub mod types;
