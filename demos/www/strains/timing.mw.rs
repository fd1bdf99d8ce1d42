// Request timing for everything under /strains: registered by demos/file_routes.rs
