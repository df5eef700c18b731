use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::ScheduleError;
use crate::external::broker::Broker;
use crate::models::{ScheduleDefinition, ScheduleDescriptor, ScheduleFile, ScheduleJobRequest, TaskMessage};

// ==============================================================================
// Cron Expressions
// ==============================================================================

/// Accepts 5-field crontab or 6/7-field (seconds first) expressions and
/// returns the 6/7-field form the scheduler understands.
///
/// Crontab day-of-week numbers (0-7, Sunday = 0 or 7) are rewritten to the
/// 1-7 (Sunday = 1) numbering of the `cron` crate.
pub fn normalize_cron(expr: &str) -> Result<String, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let invalid = |message: String| ScheduleError::InvalidCron { expr: expr.to_string(), message };

    let normalized = match fields.len() {
        5 => {
            let day_of_week = crontab_day_of_week(fields[4]).map_err(invalid)?;
            format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], day_of_week)
        }
        6 | 7 => fields.join(" "),
        n => return Err(invalid(format!("expected 5 to 7 fields, got {}", n))),
    };

    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
    Ok(normalized)
}

fn crontab_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days: Vec<u32> = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic() || c == '#') {
            // named days need no renumbering
            return Ok(field.to_string());
        }
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step = step.parse::<u32>().map_err(|_| format!("invalid step '{}'", step))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (base, Some(step))
            }
            None => (item, None),
        };
        let parse = |v: &str| -> Result<u32, String> {
            let n = v.parse::<u32>().map_err(|_| format!("invalid day of week '{}'", v))?;
            if n > 7 {
                return Err(format!("day of week {} out of range", n));
            }
            Ok(n)
        };
        let (start, end) = match (base, base.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((a, b))) => (parse(a)?, parse(b)?),
            (single, None) => {
                let n = parse(single)?;
                (n, if step.is_some() { 6 } else { n })
            }
        };
        if start > end {
            return Err(format!("invalid day-of-week range '{}'", item));
        }
        days.extend((start..=end).step_by(step.unwrap_or(1) as usize).map(|d| d % 7 + 1));
    }

    days.sort_unstable();
    days.dedup();
    Ok(days.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(","))
}

fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

pub fn next_run_time(cron: &str, timezone: Tz) -> Option<DateTime<Utc>> {
    let normalized = normalize_cron(cron).ok()?;
    let schedule = Schedule::from_str(&normalized).ok()?;
    schedule.upcoming(timezone).next().map(|t| t.with_timezone(&Utc))
}

/// True when some scheduled occurrence lies in `[now - grace, now]`.
pub fn within_misfire_grace(schedule: &Schedule, timezone: Tz, now: DateTime<Utc>, grace: Duration) -> bool {
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(60));
    let tolerance = chrono::Duration::seconds(1);
    let window_start = (now - grace - tolerance).with_timezone(&timezone);
    schedule
        .after(&window_start)
        .next()
        .is_some_and(|t| t.with_timezone(&Utc) <= now + tolerance)
}

// ==============================================================================
// Schedule Manager
// ==============================================================================

struct ScheduleEntry {
    definition: ScheduleDefinition,
    job_uuid: Uuid,
}

/// Cron-trigger registry persisted to one JSON file.
///
/// The live trigger set and the persisted set are changed together under one
/// lock. Concurrent writers from other processes are not sequenced.
pub struct ScheduleManager {
    scheduler: JobScheduler,
    broker: Arc<dyn Broker>,
    config_path: PathBuf,
    default_timezone: Tz,
    misfire_grace: Duration,
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl ScheduleManager {
    pub async fn new(
        broker: Arc<dyn Broker>,
        config_path: impl Into<PathBuf>,
        default_timezone: Tz,
        misfire_grace: Duration,
    ) -> Result<Self, ScheduleError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| ScheduleError::Scheduler(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler,
            broker,
            config_path: config_path.into(),
            default_timezone,
            misfire_grace,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Starts ticking and replays the persisted definitions.
    pub async fn start(&self) -> Result<(), ScheduleError> {
        info!("🚀 Starting schedule manager...");
        self.scheduler
            .start()
            .await
            .map_err(|e| ScheduleError::Scheduler(format!("Failed to start scheduler: {}", e)))?;

        let restored = self.replay().await;
        info!("✅ Schedule manager started with {} job(s)", restored);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ScheduleError> {
        info!("🛑 Stopping schedule manager...");
        let mut scheduler = self.scheduler.clone();
        scheduler
            .shutdown()
            .await
            .map_err(|e| ScheduleError::Scheduler(format!("Failed to stop scheduler: {}", e)))?;
        info!("✅ Schedule manager stopped");
        Ok(())
    }

    /// Re-registers every persisted definition. Bad entries are skipped.
    pub async fn replay(&self) -> usize {
        let persisted = match load_schedule_file(&self.config_path).await {
            Ok(Some(file)) => file,
            Ok(None) => return 0,
            Err(e) => {
                error!("❌ Invalid schedule configuration {}: {}", self.config_path.display(), e);
                return 0;
            }
        };

        let mut restored = 0;
        for definition in persisted.jobs {
            let job_id = definition.job_id.clone();
            match self.upsert(definition.into(), false).await {
                Ok(_) => restored += 1,
                Err(e) => warn!(job_id = %job_id, "⚠️  Skipping scheduled job from configuration: {}", e),
            }
        }
        restored
    }

    /// Validates, replaces any trigger with the same job_id and rewrites the
    /// persisted set before returning. A rejected request changes nothing.
    pub async fn add_or_update(&self, request: ScheduleJobRequest) -> Result<ScheduleDescriptor, ScheduleError> {
        self.upsert(request, true).await
    }

    // replay registers without rewriting the file it is reading from
    async fn upsert(&self, request: ScheduleJobRequest, persist: bool) -> Result<ScheduleDescriptor, ScheduleError> {
        let timezone = match request.timezone.as_deref().filter(|t| !t.trim().is_empty()) {
            Some(name) => parse_timezone(name)?,
            None => self.default_timezone,
        };
        let normalized = normalize_cron(&request.cron)?;

        let definition = ScheduleDefinition {
            job_id: request.job_id,
            cron: request.cron,
            task_name: request.task_name,
            args: request.args,
            kwargs: request.kwargs,
            timezone: timezone.name().to_string(),
        };

        let mut entries = self.entries.lock().await;
        let job = self.build_job(&definition, &normalized, timezone)?;

        // the file is written first so a failed write leaves the live set untouched
        if persist {
            let mut jobs = persisted_definitions(&entries, Some(&definition.job_id));
            jobs.push(definition.clone());
            self.write_definitions(jobs).await?;
        }

        let previous = entries.remove(&definition.job_id);
        if let Some(previous) = &previous {
            if let Err(e) = self.scheduler.remove(&previous.job_uuid).await {
                warn!(job_id = %definition.job_id, "⚠️  Failed to remove previous trigger: {}", e);
            }
        }
        let job_uuid = match self.scheduler.add(job).await {
            Ok(job_uuid) => job_uuid,
            Err(e) => {
                let err = ScheduleError::Scheduler(format!("Failed to add job {}: {}", definition.job_id, e));
                self.rollback(&mut entries, previous, persist).await;
                return Err(err);
            }
        };

        info!(
            "📅 Scheduled: {} -> {} [cron: {}, tz: {}]",
            definition.job_id, definition.task_name, definition.cron, definition.timezone
        );
        let descriptor = describe(&definition);
        entries.insert(definition.job_id.clone(), ScheduleEntry { definition, job_uuid });

        Ok(descriptor)
    }

    /// Re-registers the entry a failed upsert displaced and, when the file was
    /// already rewritten, writes the restored set back.
    async fn rollback(
        &self,
        entries: &mut HashMap<String, ScheduleEntry>,
        previous: Option<ScheduleEntry>,
        persist: bool,
    ) {
        if let Some(previous) = previous {
            let job_id = previous.definition.job_id.clone();
            match self.register(&previous.definition).await {
                Ok(job_uuid) => {
                    entries.insert(job_id, ScheduleEntry { definition: previous.definition, job_uuid });
                }
                Err(e) => error!(job_id = %job_id, "❌ Failed to restore previous trigger: {}", e),
            }
        }
        if persist {
            if let Err(e) = self.write_definitions(persisted_definitions(entries, None)).await {
                error!("❌ Failed to restore schedule configuration: {}", e);
            }
        }
    }

    async fn register(&self, definition: &ScheduleDefinition) -> Result<Uuid, ScheduleError> {
        let timezone = parse_timezone(&definition.timezone)?;
        let normalized = normalize_cron(&definition.cron)?;
        let job = self.build_job(definition, &normalized, timezone)?;
        self.scheduler
            .add(job)
            .await
            .map_err(|e| ScheduleError::Scheduler(format!("Failed to add job {}: {}", definition.job_id, e)))
    }

    /// Removing an unknown job is a no-op. The file is rewritten before the
    /// live trigger goes, so a failed write keeps the job scheduled.
    pub async fn remove(&self, job_id: &str) -> Result<(), ScheduleError> {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(job_id) {
            return Ok(());
        }
        self.write_definitions(persisted_definitions(&entries, Some(job_id))).await?;

        if let Some(entry) = entries.remove(job_id) {
            if let Err(e) = self.scheduler.remove(&entry.job_uuid).await {
                warn!(job_id = %job_id, "⚠️  Failed to remove trigger: {}", e);
            }
        }
        info!("🗑️  Unscheduled: {}", job_id);
        Ok(())
    }

    pub async fn list(&self) -> Vec<ScheduleDescriptor> {
        let entries = self.entries.lock().await;
        let mut descriptors: Vec<ScheduleDescriptor> =
            entries.values().map(|e| describe(&e.definition)).collect();
        descriptors.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        descriptors
    }

    pub async fn get(&self, job_id: &str) -> Option<ScheduleDescriptor> {
        let entries = self.entries.lock().await;
        entries.get(job_id).map(|e| describe(&e.definition))
    }

    fn build_job(&self, definition: &ScheduleDefinition, normalized: &str, timezone: Tz) -> Result<Job, ScheduleError> {
        let schedule = Schedule::from_str(normalized).map_err(|e| ScheduleError::InvalidCron {
            expr: definition.cron.clone(),
            message: e.to_string(),
        })?;
        let broker = self.broker.clone();
        let grace = self.misfire_grace;
        let job_id = definition.job_id.clone();
        let task_name = definition.task_name.clone();
        let args = definition.args.clone();
        let kwargs = definition.kwargs.clone();

        Job::new_async_tz(normalized, timezone, move |_uuid, _l| {
            let broker = broker.clone();
            let schedule = schedule.clone();
            let job_id = job_id.clone();
            let message = TaskMessage::new(task_name.clone(), args.clone(), kwargs.clone());
            Box::pin(async move {
                let trigger = Trigger { job_id: &job_id, schedule: &schedule, timezone, grace };
                dispatch_if_due(broker.as_ref(), &trigger, Utc::now(), message).await;
            })
        })
        .map_err(|e| ScheduleError::Scheduler(format!("Failed to create job {}: {}", definition.job_id, e)))
    }

    async fn write_definitions(&self, mut jobs: Vec<ScheduleDefinition>) -> Result<(), ScheduleError> {
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        write_schedule_file(&self.config_path, &ScheduleFile { jobs })
            .await
            .map_err(|e| ScheduleError::Persist(e.to_string()))
    }
}

/// Current definitions, leaving out `except`.
fn persisted_definitions(entries: &HashMap<String, ScheduleEntry>, except: Option<&str>) -> Vec<ScheduleDefinition> {
    entries
        .values()
        .filter(|e| Some(e.definition.job_id.as_str()) != except)
        .map(|e| e.definition.clone())
        .collect()
}

struct Trigger<'a> {
    job_id: &'a str,
    schedule: &'a Schedule,
    timezone: Tz,
    grace: Duration,
}

/// Sends the message unless the firing at `now` falls outside the misfire
/// grace window. Returns whether it was sent.
async fn dispatch_if_due(broker: &dyn Broker, trigger: &Trigger<'_>, now: DateTime<Utc>, message: TaskMessage) -> bool {
    let job_id = trigger.job_id;
    if !within_misfire_grace(trigger.schedule, trigger.timezone, now, trigger.grace) {
        warn!(job_id = %job_id, "⏭️  Trigger missed its grace period, skipping");
        return false;
    }
    info!(job_id = %job_id, task_id = %message.id, "Dispatch scheduled task {}", message.task_name);
    match broker.send_task(&message).await {
        Ok(()) => true,
        Err(e) => {
            error!(job_id = %job_id, "❌ Failed to dispatch scheduled task: {}", e);
            false
        }
    }
}

fn describe(definition: &ScheduleDefinition) -> ScheduleDescriptor {
    let next = parse_timezone(&definition.timezone)
        .ok()
        .and_then(|tz| next_run_time(&definition.cron, tz));
    ScheduleDescriptor {
        job_id: definition.job_id.clone(),
        cron: definition.cron.clone(),
        task_name: definition.task_name.clone(),
        timezone: definition.timezone.clone(),
        next_run_time: next,
    }
}

pub async fn load_schedule_file(path: &Path) -> Result<Option<ScheduleFile>, std::io::Error> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Whole-file rewrite through a temporary sibling and a rename.
async fn write_schedule_file(path: &Path, file: &ScheduleFile) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(file)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await
}
