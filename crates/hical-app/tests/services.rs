#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use hical_app::{AppServices, PlatformPorts};
use hical_calendar::{MemoryNativeCalendar, NativeItem, DEFAULT_CALENDAR_ID};
use hical_core::{Config, PremiumFlag};
use hical_events::{Event, RecurrenceRequest, RecurrenceType, ReminderKind};
use hical_notify::{notification_id, Authorization, MemoryNotificationCenter, NotificationCenter};
use hical_sync::MemoryCloudBackend;

struct Ports {
    notifications: Arc<MemoryNotificationCenter>,
    calendar: Arc<MemoryNativeCalendar>,
    cloud: Arc<MemoryCloudBackend>,
}

fn ports(premium: bool) -> (Ports, PlatformPorts) {
    let notifications = Arc::new(MemoryNotificationCenter::new(Authorization::Authorized));
    let calendar = Arc::new(MemoryNativeCalendar::default());
    let cloud = Arc::new(MemoryCloudBackend::new());
    let platform = PlatformPorts {
        notifications: notifications.clone(),
        calendar: calendar.clone(),
        cloud: cloud.clone(),
        entitlements: Arc::new(PremiumFlag::new(premium)),
    };
    (
        Ports {
            notifications,
            calendar,
            cloud,
        },
        platform,
    )
}

#[tokio::test]
async fn saved_event_flows_to_notifications_cloud_and_calendar() {
    let (ports, platform) = ports(true);
    let services = AppServices::build_in_memory(Config::default(), platform).unwrap();

    let start = Utc::now() + ChronoDuration::days(3);
    let event = services
        .store()
        .add(Event::new("Parent evening").with_time(start, None))
        .unwrap();

    let pending = ports.notifications.pending_ids();
    assert_eq!(pending, vec![notification_id(&event.id, ReminderKind::DayBefore)]);

    let report = services.sync_now().await.unwrap();
    assert!(report.success);
    assert_eq!(ports.cloud.live_events().len(), 1);

    let bridge_report = services.bridge().enable_sync().await.unwrap();
    assert_eq!(bridge_report.exported, 1);
    assert_eq!(ports.calendar.all_items().len(), 1);

    services.store().delete(&event.id).unwrap();
    assert!(ports.notifications.pending_ids().is_empty());
}

#[tokio::test]
async fn recurring_creation_stores_one_group() {
    let (_ports, platform) = ports(false);
    let services = AppServices::build_in_memory(Config::default(), platform).unwrap();

    let request = RecurrenceRequest {
        title: "Standup".to_string(),
        base_date: Utc::now().date_naive() + ChronoDuration::days(1),
        start_at: None,
        end_at: None,
        details: None,
        reminders: BTreeSet::from([ReminderKind::DayBefore]),
        recurrence_type: RecurrenceType::Daily,
        count: Some(5),
        end_date: None,
    };
    let created = services.create_events(&request).unwrap();
    assert_eq!(created.len(), 5);

    let group = created[0].recurrence_group_id.clone().unwrap();
    assert_eq!(services.store().events_in_group(&group).len(), 5);
}

#[tokio::test]
async fn creation_session_saves_once() {
    let (_ports, platform) = ports(false);
    let services = AppServices::build_in_memory(Config::default(), platform).unwrap();

    let session = services.new_event_session(Event::new("Dentist"));
    let first = session.save().await.unwrap();
    let second = session.save().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(services.store().count(), 1);
}

#[tokio::test]
async fn gated_features_without_premium() {
    let (_ports, platform) = ports(false);
    let services = AppServices::build_in_memory(Config::default(), platform).unwrap();

    assert!(services.sync_now().await.unwrap_err().is_gate());
    assert!(services.bridge().perform_sync().await.unwrap_err().is_gate());
    assert!(!services.cloud().should_auto_sync());
}

#[tokio::test]
async fn events_survive_rebuild_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = dir.path().join("data");

    {
        let (_ports, platform) = ports(false);
        let services = AppServices::build(config.clone(), platform).unwrap();
        services.store().add(Event::new("Passport renewal")).unwrap();
        services.shutdown().await;
    }

    let (_ports, platform) = ports(false);
    let services = AppServices::build(config, platform).unwrap();
    assert_eq!(services.store().count(), 1);
    assert_eq!(services.store().dirty_count().unwrap(), 1);
}

#[tokio::test]
async fn background_tasks_stop_on_shutdown() {
    let (ports, platform) = ports(true);
    let services = AppServices::build_in_memory(Config::default(), platform).unwrap();
    services.store().add(Event::new("Call grandma")).unwrap();

    services.spawn_background_tasks();
    // The first auto-sync check fires immediately when nothing was synced yet.
    for _ in 0..50 {
        if !ports.cloud.live_events().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(ports.cloud.live_events().len(), 1);

    services.on_background();
    tokio::time::timeout(Duration::from_secs(5), services.shutdown())
        .await
        .unwrap();
}

async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    done()
}

#[tokio::test]
async fn calendar_follows_saves_and_native_changes() {
    let (ports, platform) = ports(true);
    let services = AppServices::build_in_memory(Config::default(), platform).unwrap();
    services.bridge().enable_sync().await.unwrap();
    services.spawn_background_tasks();

    services
        .store()
        .add(Event::new("School play").with_time(Utc::now() + ChronoDuration::days(2), None))
        .unwrap();
    assert!(wait_until(|| ports.calendar.all_items().len() == 1).await);

    let start = Utc::now() + ChronoDuration::days(4);
    ports.calendar.insert(NativeItem {
        id: None,
        calendar_id: DEFAULT_CALENDAR_ID.to_string(),
        title: "Swim meet".to_string(),
        start,
        end: start + ChronoDuration::hours(2),
        all_day: false,
        notes: None,
        alarm_offsets: Vec::new(),
        last_modified: Utc::now(),
    });
    assert!(wait_until(|| services.store().search("Swim meet").len() == 1).await);
    assert_eq!(ports.calendar.all_items().len(), 2);

    tokio::time::timeout(Duration::from_secs(5), services.shutdown())
        .await
        .unwrap();
}
