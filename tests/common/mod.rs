//! Common test utilities for dtconsume integration tests.

use dtconsume::{AggVarId, AggregateSink, DecodedValue, EventSink, ProbeDescriptor};

/// Everything a consumer delivered, in delivery order.
#[derive(Debug, Default)]
pub struct Collected {
    pub events: Vec<(ProbeDescriptor, DecodedValue)>,
    pub printfs: Vec<(ProbeDescriptor, String)>,
    pub aggregates: Vec<(AggVarId, Vec<DecodedValue>, DecodedValue)>,
}

impl EventSink for Collected {
    fn on_event(&mut self, probe: &ProbeDescriptor, value: DecodedValue) {
        self.events.push((probe.clone(), value));
    }

    fn on_printf(&mut self, probe: &ProbeDescriptor, text: &str) {
        self.printfs.push((probe.clone(), text.to_string()));
    }
}

impl AggregateSink for Collected {
    fn on_aggregate(&mut self, varid: AggVarId, keys: Vec<DecodedValue>, value: DecodedValue) {
        self.aggregates.push((varid, keys, value));
    }
}

pub fn probe(provider: &str, function: &str, name: &str) -> ProbeDescriptor {
    ProbeDescriptor::new(provider, "", function, name)
}
