// GET, POST: registered by demos/file_routes.rs
