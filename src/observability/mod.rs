// Observability: metric catalog and recording helpers.

pub mod metrics;
