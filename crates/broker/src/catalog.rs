//! Charts rendered as protocol services.

use kibosh_core::{Chart, PlanRef};

use crate::{PlanMetadata, Service, ServicePlan};

pub fn build_catalog(charts: &[Chart]) -> Vec<Service> {
    charts.iter().map(service_for).collect()
}

fn service_for(chart: &Chart) -> Service {
    let service_id = chart.service_id();
    let plans = chart
        .plans
        .values()
        .map(|plan| {
            let bullets = if plan.bullets.is_empty() { vec![plan.description.clone()] } else { plan.bullets.clone() };
            ServicePlan {
                id: PlanRef::new(service_id.as_str(), plan.name.as_str()).to_string(),
                name: plan.name.clone(),
                description: plan.description.clone(),
                free: plan.is_free(),
                bindable: plan.is_bindable(),
                metadata: PlanMetadata { display_name: plan.name.clone(), bullets },
            }
        })
        .collect();
    Service {
        id: service_id,
        name: chart.name.clone(),
        description: chart.description.clone(),
        bindable: true,
        plan_updateable: true,
        plans,
    }
}
