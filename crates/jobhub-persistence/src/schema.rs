//! Esquema Diesel (declarado a mano, alineado con `migrations/`).

diesel::table! {
    workflows (id) {
        id -> BigInt,
        key -> Text,
        name -> Text,
        internal -> Bool,
        active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    jobs (id) {
        id -> Uuid,
        workflow_id -> BigInt,
        parent_id -> Nullable<Uuid>,
        status -> Text,
        trigger_kind -> Text,
        trigger_id -> Nullable<Text>,
        payload -> Jsonb,
        dedupe_id -> Nullable<Text>,
        options -> Jsonb,
        checkpoint -> Nullable<Integer>,
        context -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    job_steps (id) {
        id -> BigInt,
        job_id -> Uuid,
        name -> Text,
        step_index -> Integer,
        status -> Text,
        runs -> Integer,
        retries -> Integer,
        result -> Nullable<Jsonb>,
        resume -> Nullable<Jsonb>,
        started_at -> Timestamptz,
        finished_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    schedules (id) {
        id -> BigInt,
        workflow_id -> BigInt,
        cron_expression -> Text,
        timezone -> Nullable<Text>,
        active -> Bool,
        skip_next_run -> Integer,
        max_retries -> Nullable<Integer>,
        context -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    event_subscriptions (id) {
        id -> BigInt,
        workflow_id -> BigInt,
        name -> Text,
        provider -> Nullable<Text>,
        connection -> Nullable<Text>,
        active -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    queue_jobs (queue, id) {
        queue -> Text,
        id -> Text,
        seq -> BigInt,
        message -> Jsonb,
        state -> Text,
        attempts -> Integer,
        attempts_made -> Integer,
        dedupe -> Nullable<Text>,
        due_at -> Nullable<Timestamptz>,
        locked_until -> Nullable<Timestamptz>,
        last_claimed_at -> Nullable<Timestamptz>,
        failed_reason -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    queue_recurring (queue, id) {
        queue -> Text,
        id -> Text,
        pattern -> Text,
        timezone -> Nullable<Text>,
        immediate -> Bool,
        attempts -> Integer,
        message -> Jsonb,
        next_run -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    queue_state (queue) {
        queue -> Text,
        paused -> Bool,
        concurrency -> Nullable<Integer>,
        rate_max -> Nullable<Integer>,
        rate_per_ms -> Nullable<BigInt>,
    }
}

diesel::joinable!(jobs -> workflows (workflow_id));
diesel::joinable!(job_steps -> jobs (job_id));
diesel::joinable!(schedules -> workflows (workflow_id));
diesel::joinable!(event_subscriptions -> workflows (workflow_id));

diesel::allow_tables_to_appear_in_same_query!(
    workflows,
    jobs,
    job_steps,
    schedules,
    event_subscriptions,
    queue_jobs,
    queue_recurring,
    queue_state,
);
