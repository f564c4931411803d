//! ServiceNow integration: connector, ticket processing, and scheduling

pub mod connector;
pub mod processor;
pub mod scheduler;

pub use connector::{IncidentFilters, ServiceNowConnector};
pub use processor::{ProcessedTicket, TicketProcessor};
pub use scheduler::{FetchOutcome, TicketScheduler};
