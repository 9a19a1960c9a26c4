mod caddy;

pub use caddy::CaddyConfigurator;
