use crate::decoder::EventRecord;
use std::collections::HashMap;

/// All events of one logical request, in log arrival order. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestGroup {
    pub req_id: String,
    pub events: Vec<EventRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct Correlation {
    /// Groups in the order their correlation id was first seen
    pub groups: Vec<RequestGroup>,
    pub unassigned: usize,
}

pub fn group_by_request<I>(events: I) -> Correlation
where
    I: IntoIterator<Item = EventRecord>,
{
    let mut correlation = Correlation::default();
    let mut index: HashMap<String, usize> = HashMap::new();

    for event in events {
        let req_id = match event.req_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                correlation.unassigned += 1;
                continue;
            }
        };

        match index.get(&req_id) {
            Some(&pos) => correlation.groups[pos].events.push(event),
            None => {
                index.insert(req_id.clone(), correlation.groups.len());
                correlation.groups.push(RequestGroup {
                    req_id,
                    events: vec![event],
                });
            }
        }
    }

    tracing::debug!(
        groups = correlation.groups.len(),
        unassigned = correlation.unassigned,
        "Correlated log events"
    );
    correlation
}
