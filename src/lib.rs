// proxy-mesh: workspace umbrella for the distributed caching forward-proxy
// cluster. The implementation lives in crates/ (wire protocol, test
// fixtures) and services/ (the node daemon); this root package hosts the
// cross-service integration suites under tests/integration/.

pub use mesh_protocol as protocol;
