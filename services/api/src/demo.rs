use crate::infra::{document, midday, InMemoryStores, LoggingDispatcher};
use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use clap::Args;
use leadflow::config::PipelineConfig;
use leadflow::error::AppError;
use leadflow::workflows::leads::{
    Actor, AgencyId, AgentId, ApprovalRequest, AssignmentRequest, Clock, DocumentOwner,
    FollowUpRequest, Inquiry, LeadContact, LeadLifecycleService, LeadPriority, LeadSource,
    LeadStatus, LifecycleError, LifecycleEvent, NewLead, NewPayment, NoteRequest, PaymentRecording,
    PaymentRequest, PaymentStatus, PropertyId, Role, StatusUpdate, TransactionStatus,
    TransactionStatusRequest,
};
use std::sync::Arc;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Date the walkthrough runs on (YYYY-MM-DD). Defaults to today.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) today: Option<NaiveDate>,
    /// Mark the lead lost after negotiation instead of booking it.
    #[arg(long)]
    pub(crate) lose: bool,
    /// Print every notification captured during the walkthrough.
    #[arg(long)]
    pub(crate) show_events: bool,
}

struct PinnedClock(DateTime<Utc>);

impl Clock for PinnedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

const HARBOR: &str = "agency-harbor";
const BAYVIEW: &str = "prop-bayview";

fn harbor_admin() -> Actor {
    Actor::new("admin-harbor", Role::AgencyAdmin, Some(AgencyId::new(HARBOR)))
}

fn harbor_agent() -> Actor {
    Actor::new("agent-lena", Role::Agent, Some(AgencyId::new(HARBOR)))
}

fn buyer() -> Actor {
    Actor::new("cust-nadia", Role::Customer, None)
}

pub(crate) fn inquiry(property: Option<&str>) -> NewLead {
    NewLead {
        contact: LeadContact {
            first_name: "Nadia".to_string(),
            last_name: "Berg".to_string(),
            email: "nadia.berg@example.com".to_string(),
            phone: "+1 555 0142".to_string(),
            alternate_phone: None,
            address: None,
        },
        customer: None,
        property: property.map(PropertyId::new),
        agency: None,
        source: LeadSource::Website,
        priority: LeadPriority::Hot,
        inquiry: Inquiry {
            message: Some("Is the penthouse still available for a viewing this week?".to_string()),
            ..Inquiry::default()
        },
        follow_up_at: None,
    }
}

/// What happened to the lead, captured for rendering.
#[derive(Debug)]
pub(crate) struct Walkthrough {
    pub(crate) steps: Vec<String>,
    pub(crate) final_status: LeadStatus,
    pub(crate) transaction_status: Option<TransactionStatus>,
    pub(crate) agenda: Vec<String>,
    pub(crate) events: Vec<LifecycleEvent>,
}

pub(crate) fn walkthrough(now: DateTime<Utc>, lose: bool) -> Result<Walkthrough, AppError> {
    let stores = InMemoryStores {
        dispatcher: LoggingDispatcher::recording(),
        ..InMemoryStores::default()
    };
    let service: LeadLifecycleService = stores
        .service(PipelineConfig::default())
        .with_clock(Arc::new(PinnedClock(now)));
    let admin = harbor_admin();
    let agent = harbor_agent();
    let customer = buyer();
    let mut steps = Vec::new();

    let lead = service.create_lead(&customer, inquiry(Some(BAYVIEW)))?.entity;
    steps.push(format!(
        "{} submitted {} for {} (agency {})",
        lead.contact.full_name(),
        lead.id,
        BAYVIEW,
        lead.agency().map(|agency| agency.as_str()).unwrap_or("none")
    ));

    let lead = service
        .set_approval(
            &admin,
            &lead.id,
            ApprovalRequest {
                approved: true,
                expected_version: Some(lead.version),
            },
        )?
        .entity;
    let lead = service
        .assign_lead(
            &admin,
            &lead.id,
            AssignmentRequest {
                agent: Some(AgentId::new("agent-lena")),
                expected_version: Some(lead.version),
                ..AssignmentRequest::default()
            },
        )?
        .entity;
    steps.push(format!(
        "approved and routed to {}",
        lead.assigned_agent()
            .map(|agent| agent.as_str())
            .unwrap_or("nobody")
    ));

    for status in [LeadStatus::Contacted, LeadStatus::SiteVisit] {
        let moved = service.update_lead_status(
            &agent,
            &lead.id,
            StatusUpdate {
                status,
                lost_reason: None,
                expected_version: None,
            },
        )?;
        steps.push(format!("agent moved lead to {}", moved.entity.lead.status()));
    }

    service.add_note(
        &agent,
        &lead.id,
        NoteRequest {
            text: "Viewing went well; buyer asked about parking.".to_string(),
        },
    )?;
    service.set_follow_up(
        &agent,
        &lead.id,
        FollowUpRequest {
            follow_up_at: Some(now - Duration::hours(2)),
            expected_version: None,
        },
    )?;
    let agenda = service
        .list_follow_ups(&agent, None)?
        .into_iter()
        .map(|entry| {
            format!(
                "{} ({}) {} at {}",
                entry.contact_name,
                entry.status,
                entry.bucket.label(),
                entry.follow_up_at.format("%Y-%m-%d %H:%M")
            )
        })
        .collect();
    let dispatched = service.dispatch_due_follow_ups(&admin)?;
    steps.push(format!(
        "{} overdue follow-up reminder(s) dispatched",
        dispatched.entity.len()
    ));
    service.complete_follow_up(&agent, &lead.id, None)?;

    service.update_lead_status(
        &agent,
        &lead.id,
        StatusUpdate {
            status: LeadStatus::Negotiation,
            lost_reason: None,
            expected_version: None,
        },
    )?;

    if lose {
        let lost = service.update_lead_status(
            &agent,
            &lead.id,
            StatusUpdate {
                status: LeadStatus::Lost,
                lost_reason: Some("price_too_high".to_string()),
                expected_version: None,
            },
        )?;
        steps.push(format!(
            "lead lost ({})",
            lost.entity
                .lead
                .lost_reason()
                .map(|reason| reason.label())
                .unwrap_or("unspecified")
        ));
        return Ok(Walkthrough {
            steps,
            final_status: lost.entity.lead.status(),
            transaction_status: None,
            agenda,
            events: stores.dispatcher.events(),
        });
    }

    let booked = service.update_lead_status(
        &admin,
        &lead.id,
        StatusUpdate {
            status: LeadStatus::Booked,
            lost_reason: None,
            expected_version: None,
        },
    )?;
    let Some(view) = booked.entity.transaction else {
        return Err(AppError::Lifecycle(LifecycleError::Validation(
            "booking did not open a transaction".to_string(),
        )));
    };
    let transaction_id = view.transaction.id.clone();
    steps.push(format!(
        "booked; {} opened for {} {}",
        transaction_id, view.payment_details.due_amount, view.transaction.currency
    ));

    stores
        .catalog
        .attach_document(document(
            "doc-offer",
            DocumentOwner::Transaction(transaction_id.clone()),
            BAYVIEW,
            "Signed offer",
        ))
        .and_then(|()| {
            stores.catalog.attach_document(document(
                "doc-floorplan",
                DocumentOwner::Lead(lead.id.clone()),
                BAYVIEW,
                "Floor plan",
            ))
        })
        .map_err(LifecycleError::from)?;

    let paid = service.record_payment(
        &admin,
        &transaction_id,
        PaymentRequest {
            payment: PaymentRecording::New(NewPayment {
                amount: view.transaction.amount,
                currency: view.transaction.currency.clone(),
                status: PaymentStatus::Completed,
                method: Some("wire".to_string()),
                reference: Some("WIRE-88213".to_string()),
                paid_at: Some(now),
            }),
            expected_version: None,
        },
    )?;
    steps.push(format!(
        "payment recorded: {} paid, {} due",
        paid.entity.payment_details.amount_paid, paid.entity.payment_details.due_amount
    ));

    service.customer_confirm(&customer, &transaction_id, None)?;
    steps.push("buyer confirmed the transaction".to_string());
    let completed = service.update_transaction_status(
        &admin,
        &transaction_id,
        TransactionStatusRequest {
            status: TransactionStatus::Completed,
            expected_version: None,
        },
    )?;
    steps.push("agency confirmed; transaction completed".to_string());

    let documents = service.transaction_documents(&customer, &transaction_id)?;
    steps.push(format!(
        "paperwork available to the buyer: {}",
        documents
            .iter()
            .map(|document| document.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    ));

    let final_status = service.get_lead(&admin, &lead.id)?.status();
    Ok(Walkthrough {
        steps,
        final_status,
        transaction_status: Some(completed.entity.transaction.status()),
        agenda,
        events: stores.dispatcher.events(),
    })
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        today,
        lose,
        show_events,
    } = args;
    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let summary = walkthrough(midday(today), lose)?;

    println!("Lead lifecycle demo ({today})");
    for (index, step) in summary.steps.iter().enumerate() {
        println!("  {}. {}", index + 1, step);
    }

    if summary.agenda.is_empty() {
        println!("\nFollow-up agenda: empty");
    } else {
        println!("\nFollow-up agenda");
        for entry in &summary.agenda {
            println!("- {}", entry);
        }
    }

    println!("\nFinal lead status: {}", summary.final_status);
    match summary.transaction_status {
        Some(status) => println!("Transaction status: {}", status),
        None => println!("Transaction status: none opened"),
    }

    println!("Notifications emitted: {}", summary.events.len());
    if show_events {
        for event in &summary.events {
            match serde_json::to_string(event) {
                Ok(json) => println!("  {}", json),
                Err(err) => println!("  {} (unserializable: {})", event.name(), err),
            }
        }
    }
    Ok(())
}
