//! Prometheus text exposition format.
//!
//! Renders the pool, admission, and replica state into the Prometheus text
//! exposition format for scraping.

use std::fmt::Write;

use fleetgrid_admission::AdmissionStats;
use fleetgrid_data::ReplicaLagEstimate;
use fleetgrid_pool::PoolStatus;

/// Everything `/metrics` reports, gathered at scrape time.
pub struct FleetMetrics<'a> {
    pub pool: &'a PoolStatus,
    pub admission: AdmissionStats,
    pub replicas: &'a [ReplicaLagEstimate],
}

/// Render the current metrics into Prometheus text format.
pub fn render_prometheus(metrics: &FleetMetrics<'_>) -> String {
    let mut out = String::new();
    let pool = metrics.pool;

    header(&mut out, "fleetgrid_pool_instances", "Instances by lifecycle state.", "gauge");
    for (state, count) in [
        ("ready", pool.ready),
        ("provisioning", pool.provisioning),
        ("draining", pool.draining),
    ] {
        let _ = writeln!(out, "fleetgrid_pool_instances{{state=\"{state}\"}} {count}");
    }

    header(&mut out, "fleetgrid_snapshot_version", "Version of the published routable snapshot.", "gauge");
    let _ = writeln!(out, "fleetgrid_snapshot_version {}", pool.snapshot_version);

    header(&mut out, "fleetgrid_scaling_target", "Target instance count of the applied decision.", "gauge");
    let _ = writeln!(out, "fleetgrid_scaling_target {}", pool.target);

    header(&mut out, "fleetgrid_instance_load", "Last reported utilization per instance.", "gauge");
    for inst in &pool.instances {
        let _ = writeln!(out, "fleetgrid_instance_load{{instance=\"{}\"}} {:.4}", inst.id, inst.load);
    }

    header(&mut out, "fleetgrid_instance_in_flight", "Requests in flight per instance.", "gauge");
    for inst in &pool.instances {
        let _ = writeln!(out, "fleetgrid_instance_in_flight{{instance=\"{}\"}} {}", inst.id, inst.in_flight);
    }

    header(&mut out, "fleetgrid_admission_total", "Admission outcomes since start.", "counter");
    let stats = metrics.admission;
    for (outcome, count) in [
        ("admitted", stats.admitted),
        ("rejected", stats.rejected),
        ("queued", stats.queued),
        ("affinity_hit", stats.affinity_hits),
    ] {
        let _ = writeln!(out, "fleetgrid_admission_total{{outcome=\"{outcome}\"}} {count}");
    }

    header(&mut out, "fleetgrid_replica_lag_seconds", "Last measured replication lag.", "gauge");
    for replica in metrics.replicas {
        if let Some(lag) = replica.lag {
            let _ = writeln!(
                out,
                "fleetgrid_replica_lag_seconds{{replica=\"{}\"}} {:.3}",
                replica.replica,
                lag.as_secs_f64()
            );
        }
    }

    out
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}
