//! Counter series builder.

use serde_json::Value;
use trace_model::{color_id_for_general_purpose_string, CounterSeries};

use crate::importer::{us_to_ms, TraceEventImporter};
use crate::warning::WarningKind;

impl TraceEventImporter {
    pub(crate) fn process_counter_event(&mut self, event: trace_format::TraceEvent) {
        let base_name = event.name.clone().unwrap_or_default();
        let name = match event.scoped_id() {
            Some(id) => format!("{base_name}[{id}]"),
            None => base_name,
        };
        let category = event.cat.clone().unwrap_or_default();
        let ts = us_to_ms(event.ts);

        let series_args: Vec<(String, f64)> = match event.args.as_ref() {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_f64().unwrap_or(0.0)))
                .collect(),
            _ => Vec::new(),
        };

        let pid = event.pid.unwrap_or(0);
        let is_new = self
            .model
            .process_mut(pid)
            .counter_mut(&category, &name)
            .series
            .is_empty();

        if is_new && series_args.is_empty() {
            self.model
                .process_mut(pid)
                .counters
                .remove(&(category.clone(), name.clone()));
            self.warn(
                WarningKind::CounterParseError,
                format!("counter '{name}' has no series in its first event"),
            );
            return;
        }

        let counter = self.model.process_mut(pid).counter_mut(&category, &name);
        if is_new {
            for (series_name, _) in &series_args {
                let color_id = match &event.cname {
                    Some(cname) => color_id_for_general_purpose_string(cname),
                    None => {
                        color_id_for_general_purpose_string(&format!("{name}.{series_name}"))
                    }
                };
                counter
                    .series
                    .push(CounterSeries::new(series_name.clone(), color_id));
            }
        }

        // One sample per series per event; series absent from this event's
        // args sample as zero.
        let values: Vec<f64> = counter
            .series
            .iter()
            .map(|series| {
                series_args
                    .iter()
                    .find(|(series_name, _)| *series_name == series.name)
                    .map(|(_, value)| *value)
                    .unwrap_or(0.0)
            })
            .collect();
        counter.add_sample(ts, &values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use trace_format::TraceEvent;

    use crate::config::ImportConfig;

    fn counter_event(name: &str, ts: f64, args: Value) -> TraceEvent {
        let mut event = TraceEvent::builder()
            .ph("C".to_string())
            .name(name.to_string())
            .pid(1)
            .tid(1)
            .ts(ts)
            .build();
        event.args = Some(args);
        event
    }

    #[rstest]
    fn first_event_defines_series() {
        let mut imp = TraceEventImporter::new(ImportConfig::default());
        imp.process_counter_event(counter_event(
            "mem",
            0.0,
            serde_json::json!({"used": 10, "free": 20}),
        ));
        imp.process_counter_event(counter_event("mem", 1000.0, serde_json::json!({"used": 11})));
        let counter = &imp.model.processes[&1].counters[&("".to_string(), "mem".to_string())];
        assert_eq!(counter.series.len(), 2);
        assert_eq!(counter.sample_count(), 2);
        // Missing args default to zero.
        assert_eq!(counter.series[0].samples[1].value, 0.0);
        assert_eq!(counter.series[1].samples[1].value, 11.0);
    }

    #[rstest]
    fn zero_args_first_event_drops_counter() {
        let mut imp = TraceEventImporter::new(ImportConfig::default());
        imp.process_counter_event(counter_event("mem", 0.0, serde_json::json!({})));
        assert!(imp.model.processes[&1].counters.is_empty());
        assert_eq!(imp.warnings[0].kind, WarningKind::CounterParseError);
    }

    #[rstest]
    fn id_suffixes_counter_name() {
        let mut imp = TraceEventImporter::new(ImportConfig::default());
        let mut event = counter_event("objects", 0.0, serde_json::json!({"count": 1}));
        event.id = Some("0x7".to_string());
        imp.process_counter_event(event);
        assert!(imp.model.processes[&1]
            .counters
            .contains_key(&("".to_string(), "objects[0x7]".to_string())));
    }
}
