use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use dotenvy::dotenv;
use serenity::client::Context;
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::guild::Guild;
use serenity::model::id::{GuildId, UserId};
use serenity::model::prelude::VoiceState;
use serenity::{
    async_trait,
    client::{Client, EventHandler},
    framework::{
        standard::{
            macros::{command, group},
            Args, CommandError, CommandResult,
        },
        StandardFramework,
    },
    model::{channel::Message, gateway::Ready},
    prelude::GatewayIntents,
    Result as SerenityResult,
};
use songbird::SerenityInit;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::backend::{SongbirdBackend, TrackEndEvent};
use crate::config::Config;
use crate::models::LoopMode;
use crate::player::{Player, PlayerRegistry};
use crate::playlists::{tracks_from_playlist_url, PlaylistStore};
use crate::spotify::{NowPlayingSource, SpotifyClient};
use crate::stalk::StalkRegistry;

mod backend;
mod config;
mod error;
mod models;
mod player;
mod playlists;
mod spotify;
mod stalk;

struct Handler;

pub struct PlayerManager;

impl serenity::prelude::TypeMapKey for PlayerManager {
    type Value = Arc<PlayerRegistry>;
}

pub struct StalkManager;

impl serenity::prelude::TypeMapKey for StalkManager {
    type Value = Arc<StalkRegistry>;
}

pub struct SourceManager;

impl serenity::prelude::TypeMapKey for SourceManager {
    type Value = Arc<SpotifyClient>;
}

pub struct PlaylistManager;

impl serenity::prelude::TypeMapKey for PlaylistManager {
    type Value = Arc<PlaylistStore>;
}

pub struct ConfigManager;

impl serenity::prelude::TypeMapKey for ConfigManager {
    type Value = Arc<Config>;
}

pub struct TrackEndSender;

impl serenity::prelude::TypeMapKey for TrackEndSender {
    type Value = mpsc::UnboundedSender<TrackEndEvent>;
}

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl serenity::prelude::TypeMapKey for BotDataMap {
    type Value = BotData;
}

const ALONE_DISCONNECT_DELAY: Duration = Duration::from_secs(60);

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        let bot_data = BotData { id: ready.user.id.0 };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let bot_id: Option<u64>;

        {
            let data = ctx.data.read().await;
            bot_id = data.get::<BotDataMap>().map(|data| data.id);
        }

        let bot_id = match bot_id {
            Some(id) => id,
            None => return,
        };

        // The bot itself lost its voice connection: drop the session state.
        if new.channel_id.is_none() && new.user_id.0 == bot_id {
            if let Some(guild_id) = new.guild_id {
                info!("Voice connection for guild {} went away", guild_id.0);
                let player = guild_player(&ctx, guild_id).await;
                player.lock().await.reset_after_disconnect();
            }
            return;
        }

        // Someone else left the channel the bot is playing in; disconnect
        // after a grace period if nobody comes back.
        if new.user_id.0 == bot_id {
            return;
        }
        let left_channel = match old.as_ref().and_then(|state| state.channel_id) {
            Some(channel) if Some(channel) != new.channel_id => channel,
            _ => return,
        };
        let guild_id = match new.guild_id {
            Some(guild_id) => guild_id,
            None => return,
        };

        let manager = songbird::get(&ctx)
            .await
            .expect("Songbird Voice client placed in at initialisation.")
            .clone();
        let bot_channel = match manager.get(guild_id) {
            Some(call) => call.lock().await.current_channel(),
            None => return,
        };
        let bot_channel = match bot_channel {
            Some(channel) => channel.0,
            None => return,
        };
        if bot_channel != left_channel.0 || listeners_in_channel(&ctx, guild_id, bot_channel, bot_id) > 0
        {
            return;
        }

        info!("Alone in voice channel, scheduling disconnect for guild {}", guild_id.0);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ALONE_DISCONNECT_DELAY).await;
            if listeners_in_channel(&ctx, guild_id, bot_channel, bot_id) == 0 {
                info!("Disconnecting from empty channel in guild {}", guild_id.0);
                disconnect_and_reset(&ctx, guild_id).await;
            }
        });
    }
}

#[group]
#[commands(
    play, playnext, pause, unpause, skip, stop, queue, clearqueue, shuffle, loop_mode, seek,
    volume, nowplaying, history, replay, autoplay, nightcore, bassboost, normalize, stalk,
    stopstalk, saveplaylist, playlists_list, loadplaylist, deleteplaylist, help
)]
struct General;

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::fmt::init();

    let config = Arc::new(Config::from_env().expect("Invalid configuration"));

    let framework = StandardFramework::new()
        .configure(|c| c.prefix("!"))
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird()
        .await
        .expect("Err creating client");

    let players = Arc::new(PlayerRegistry::new());
    let (track_end_tx, mut track_end_rx) = mpsc::unbounded_channel::<TrackEndEvent>();

    {
        let mut data = client.data.write().await;
        data.insert::<PlayerManager>(players.clone());
        data.insert::<StalkManager>(Arc::new(StalkRegistry::new()));
        data.insert::<SourceManager>(Arc::new(SpotifyClient::new(&config)));
        data.insert::<PlaylistManager>(Arc::new(PlaylistStore::load(
            config.playlist_store_path.clone(),
        )));
        data.insert::<ConfigManager>(config);
        data.insert::<TrackEndSender>(track_end_tx);
    }

    // Track-end events mutate players through the same per-guild lock the
    // commands use.
    tokio::spawn(async move {
        while let Some(event) = track_end_rx.recv().await {
            let player = players.get(event.guild_id).await;
            let mut player = player.lock().await;
            if let Err(e) = player
                .handle_track_end(Some(event.track), event.reason, event.session)
                .await
            {
                warn!("Advance after track end failed: {e}");
            }
        }
    });

    tokio::spawn(async move {
        let _ = client.start().await.map_err(|why| info!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c().await.expect("Control-C interruption failed!");

    info!("Received Ctrl-C, shutting down.");
}

#[command]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    play_with_reaction(ctx, msg, args, false).await
}

#[command]
#[only_in(guilds)]
async fn playnext(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    play_with_reaction(ctx, msg, args, true).await
}

#[command]
#[only_in(guilds)]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let message = r#"
**Commands:**
    **play [URL|Title]** - Plays (or adds to the queue) tracks given a URL or a title (supports playlists).
    **playnext [URL|Title]** - Adds a track to the top of the queue to be played next.
    **pause** / **unpause** - Pauses or resumes the current track.
    **skip** - Plays the next track.
    **stop** - Stops playback, clears the queue and leaves the channel.
    **queue** / **clearqueue** - Shows or empties the queue of tracks.
    **shuffle** - Reorders the queue randomly.
    **loop [off|single|queue]** - Loops the current track or the whole queue.
    **seek [SECONDS]** - Jumps to a timestamp in the current track.
    **volume [1-100]** - Sets the playback volume.
    **nowplaying** (or **np**) - Shows the currently playing track.
    **history [COUNT]** / **replay [INDEX]** - Shows recently played tracks and replays one.
    **autoplay [on|off]** - Plays a random track from the history when the queue ends.
    **nightcore [on|off]** / **bassboost [off|1-100]** / **normalize** - Audio filters.
    **stalk** / **stopstalk** - Mirrors your streaming-service playback into the channel.
    **saveplaylist [NAME]** / **playlists** / **loadplaylist [NAME]** / **deleteplaylist [NAME]**
    "#;

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

async fn play_with_reaction(
    ctx: &Context,
    msg: &Message,
    args: Args,
    front: bool,
) -> CommandResult {
    let bot_id: Option<u64>;

    {
        let data = ctx.data.read().await;
        bot_id = data.get::<BotDataMap>().map(|data| data.id);
    }

    let loading_emoji = Unicode("⏳".to_string());

    msg.react(&ctx.http, loading_emoji.clone()).await?;

    let enqueue_result = enqueue_request(ctx, msg, args, front).await;

    if let Some(bot_id) = bot_id {
        msg.channel_id
            .delete_reaction(&ctx.http, msg.id, Some(UserId(bot_id)), loading_emoji)
            .await?;
    }

    let answer_emoji = match &enqueue_result {
        Ok(_) => "👍",
        Err(_) => "💀",
    };

    msg.react(&ctx.http, Unicode(answer_emoji.to_string())).await?;

    if let Err(error) = enqueue_result {
        check_msg(msg.channel_id.say(&ctx.http, format!("{error}")).await);
    }

    Ok(())
}

async fn enqueue_request(
    ctx: &Context,
    msg: &Message,
    args: Args,
    front: bool,
) -> Result<(), CommandError> {
    let user_input = args.message().trim().to_string();

    if user_input.is_empty() {
        return Err(CommandError::from("Tell me what to play"));
    }

    info!("User input is {user_input}");

    ensure_connected(ctx, msg).await?;

    let guild_id = get_guild_id(ctx, msg)?;
    let query = {
        let data = ctx.data.read().await;
        let config = data
            .get::<ConfigManager>()
            .expect("Config placed in at initialisation.");
        config
            .resolve_override(&user_input)
            .map(str::to_string)
            .unwrap_or(user_input)
    };

    let player = guild_player(ctx, guild_id).await;

    if is_playlist_url(&query) {
        info!("Detected playlist in {query}");

        let tracks = tracks_from_playlist_url(&query)?;
        let count = tracks.len();
        let started = {
            let mut player = player.lock().await;
            player.enqueue_all(tracks).await?
        };

        let mut reply = format!("Queued {count} tracks from the playlist.");
        if let Some(track) = started {
            reply.push_str(&format!(" Playing **{}**.", track.title));
        }
        check_msg(msg.channel_id.say(&ctx.http, reply).await);
    } else {
        let (title, started) = {
            let mut player = player.lock().await;
            let track = player.resolve_query(&query).await?;
            let title = track.title.clone();
            let started = player.enqueue_track(track, front).await?;
            (title, started)
        };

        let reply = if started.is_some() {
            format!("Playing **{title}**")
        } else if front {
            format!("**{title}** will play next")
        } else {
            format!("Added to queue: **{title}**")
        };
        check_msg(msg.channel_id.say(&ctx.http, reply).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let player = guild_player(ctx, guild_id).await;

    match player.lock().await.set_paused(true).await {
        Ok(()) => check_msg(msg.channel_id.say(&ctx.http, "Paused.").await),
        Err(_) => check_msg(msg.channel_id.say(&ctx.http, "o_O Already stopped").await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn unpause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let player = guild_player(ctx, guild_id).await;

    match player.lock().await.set_paused(false).await {
        Ok(()) => check_msg(msg.channel_id.say(&ctx.http, "Resumed.").await),
        Err(_) => check_msg(msg.channel_id.say(&ctx.http, "o_O Already stopped").await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("next")]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    info!("SKIP - invoked from guild {}!", guild_id.0);

    let player = guild_player(ctx, guild_id).await;
    let skipped = player.lock().await.skip().await;

    match skipped {
        Ok(Some(track)) => check_msg(
            msg.channel_id
                .say(&ctx.http, format!("Skipped. Now playing **{}**.", track.title))
                .await,
        ),
        Ok(None) => check_msg(
            msg.channel_id
                .say(&ctx.http, "Skipped. No more songs in the queue.")
                .await,
        ),
        Err(_) => check_msg(msg.channel_id.say(&ctx.http, "Nothing is playing.").await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let player = guild_player(ctx, guild_id).await;

    if let Err(error) = player.lock().await.stop().await {
        check_msg(msg.channel_id.say(&ctx.http, format!("{error}")).await);
        return Ok(());
    }

    leave_current_channel(ctx, msg).await?;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let player = guild_player(ctx, guild_id).await;
    let player = player.lock().await;

    if player.now_playing().is_none() && player.queue().is_empty() {
        check_msg(msg.channel_id.say(&ctx.http, "The queue is empty!").await);
        return Ok(());
    }

    let mut reply = String::new();
    if let Some(track) = player.now_playing() {
        reply.push_str(&format!(
            "**Now playing:** {} `{}`\n",
            track,
            track.duration_text()
        ));
    }

    let max_tracks = 20;
    let queue_len = player.queue().len();
    if queue_len > 0 {
        let mut lines: Vec<String> = Vec::with_capacity(min(queue_len, max_tracks));
        for (index, track) in player.queue().iter().take(max_tracks).enumerate() {
            lines.push(format!("{} - {} `{}`", index + 1, track, track.duration_text()));
        }
        reply.push_str(&format!("**Queue**:\n```{}```", lines.join("\n")));
        if queue_len > max_tracks {
            reply.push_str(&format!("...and {} more.", queue_len - max_tracks));
        }

        let total_ms: u64 = player.queue().iter().map(|t| t.duration_ms).sum();
        if total_ms > 0 {
            let mins = total_ms / 60_000;
            let secs = (total_ms / 1000) % 60;
            reply.push_str(&format!("\n**Total remaining:** {mins}:{secs:02}"));
        }
    }

    if player.autoplay_enabled() {
        reply.push_str("\nAutoplay is on.");
    }

    check_msg(msg.channel_id.say(&ctx.http, reply).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn clearqueue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let player = guild_player(ctx, guild_id).await;

    player.lock().await.queue_mut().clear();

    msg.react(&ctx.http, Unicode("👍".to_string())).await?;

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn shuffle(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    info!("SHUFFLE - invoked from guild {}!", guild_id.0);

    let player = guild_player(ctx, guild_id).await;
    player.lock().await.queue_mut().shuffle();

    msg.react(&ctx.http, Unicode("👍".to_string())).await?;

    Ok(())
}

#[command("loop")]
#[only_in(guilds)]
async fn loop_mode(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let mode = match args.single::<String>().ok().and_then(|m| m.parse::<LoopMode>().ok()) {
        Some(mode) => mode,
        None => {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, "Loop mode must be `off`, `single` or `queue`.")
                    .await,
            );
            return Ok(());
        }
    };

    let player = guild_player(ctx, guild_id).await;
    player.lock().await.set_loop_mode(mode);

    check_msg(
        msg.channel_id
            .say(&ctx.http, format!("Loop mode set to `{mode}`."))
            .await,
    );

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn seek(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let seconds = match args.single::<u64>() {
        Ok(seconds) => seconds,
        Err(_) => {
            check_msg(msg.channel_id.say(&ctx.http, "Give me a timestamp in seconds.").await);
            return Ok(());
        }
    };

    let player = guild_player(ctx, guild_id).await;
    match player.lock().await.seek_ms(seconds * 1000).await {
        Ok(()) => check_msg(
            msg.channel_id
                .say(&ctx.http, format!("Seeked to {seconds} seconds."))
                .await,
        ),
        Err(_) => check_msg(
            msg.channel_id
                .say(&ctx.http, "Failed to seek. Is something playing?")
                .await,
        ),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn volume(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let level = args.single::<u8>().unwrap_or(0);

    let player = guild_player(ctx, guild_id).await;
    match player.lock().await.set_volume(level).await {
        Ok(()) => check_msg(
            msg.channel_id
                .say(&ctx.http, format!("Volume set to {level}%"))
                .await,
        ),
        Err(error) => check_msg(msg.channel_id.say(&ctx.http, format!("{error}")).await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases("np")]
async fn nowplaying(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let player = guild_player(ctx, guild_id).await;
    let player = player.lock().await;

    match player.now_playing() {
        Some(track) => {
            let state = if player.is_paused() { " (paused)" } else { "" };
            let looping = match player.loop_mode() {
                LoopMode::Off => String::new(),
                mode => format!(" (loop: {mode})"),
            };
            check_msg(
                msg.channel_id
                    .say(
                        &ctx.http,
                        format!(
                            "Now playing: {} `{}`{state}{looping}",
                            track,
                            track.duration_text()
                        ),
                    )
                    .await,
            );
        }
        None => check_msg(
            msg.channel_id
                .say(&ctx.http, "Nothing is currently playing.")
                .await,
        ),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn history(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let count = args.single::<usize>().unwrap_or(10).clamp(1, 20);

    let player = guild_player(ctx, guild_id).await;
    let player = player.lock().await;

    if player.history().is_empty() {
        check_msg(msg.channel_id.say(&ctx.http, "No song history yet.").await);
        return Ok(());
    }

    let lines: Vec<String> = player
        .history()
        .recent(count)
        .enumerate()
        .map(|(index, track)| format!("{} - {}", index + 1, track))
        .collect();

    check_msg(
        msg.channel_id
            .say(&ctx.http, format!("**Last played:**\n```{}```", lines.join("\n")))
            .await,
    );

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn replay(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let index = match args.single::<usize>() {
        Ok(index) if index >= 1 => index,
        _ => {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, "Give me a song number from the history.")
                    .await,
            );
            return Ok(());
        }
    };

    let player = guild_player(ctx, guild_id).await;
    let replayed = player.lock().await.replay_from_history(index - 1);

    match replayed {
        Ok(track) => check_msg(
            msg.channel_id
                .say(&ctx.http, format!("Queued **{}** to play next.", track.title))
                .await,
        ),
        Err(_) => check_msg(
            msg.channel_id
                .say(&ctx.http, "Invalid song number to replay.")
                .await,
        ),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn autoplay(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let enabled = match parse_on_off(&mut args) {
        Some(enabled) => enabled,
        None => {
            check_msg(msg.channel_id.say(&ctx.http, "Say `on` or `off`.").await);
            return Ok(());
        }
    };

    let player = guild_player(ctx, guild_id).await;
    player.lock().await.set_autoplay(enabled);

    check_msg(
        msg.channel_id
            .say(
                &ctx.http,
                format!("Autoplay {}.", if enabled { "enabled" } else { "disabled" }),
            )
            .await,
    );

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn nightcore(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let enabled = match parse_on_off(&mut args) {
        Some(enabled) => enabled,
        None => {
            check_msg(msg.channel_id.say(&ctx.http, "Say `on` or `off`.").await);
            return Ok(());
        }
    };

    let player = guild_player(ctx, guild_id).await;
    match player.lock().await.set_nightcore(enabled).await {
        Ok(()) => check_msg(
            msg.channel_id
                .say(
                    &ctx.http,
                    format!("Nightcore {}.", if enabled { "enabled" } else { "disabled" }),
                )
                .await,
        ),
        Err(error) => check_msg(msg.channel_id.say(&ctx.http, format!("{error}")).await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn bassboost(ctx: &Context, msg: &Message, mut args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let value = match args.single::<String>() {
        Ok(value) => value,
        Err(_) => {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, "Value must be `off` or a number 1-100.")
                    .await,
            );
            return Ok(());
        }
    };

    let level = if value.eq_ignore_ascii_case("off") {
        None
    } else {
        match value.parse::<u8>() {
            Ok(level) => Some(level),
            Err(_) => {
                check_msg(
                    msg.channel_id
                        .say(&ctx.http, "Value must be `off` or a number 1-100.")
                        .await,
                );
                return Ok(());
            }
        }
    };

    let player = guild_player(ctx, guild_id).await;
    match player.lock().await.set_bassboost(level).await {
        Ok(()) => {
            let reply = match level {
                Some(level) => format!("Bassboost set to {level}."),
                None => "Bassboost disabled.".to_string(),
            };
            check_msg(msg.channel_id.say(&ctx.http, reply).await);
        }
        Err(error) => check_msg(msg.channel_id.say(&ctx.http, format!("{error}")).await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn normalize(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let player = guild_player(ctx, guild_id).await;

    match player.lock().await.normalize().await {
        Ok(()) => check_msg(
            msg.channel_id
                .say(&ctx.http, "Volume set to default and nightcore turned off.")
                .await,
        ),
        Err(error) => check_msg(msg.channel_id.say(&ctx.http, format!("{error}")).await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stalk(ctx: &Context, msg: &Message) -> CommandResult {
    ensure_connected(ctx, msg).await?;

    let guild_id = get_guild_id(ctx, msg)?;
    let user_id = msg.author.id.0;

    let (stalks, source) = {
        let data = ctx.data.read().await;
        (
            data.get::<StalkManager>()
                .cloned()
                .expect("Stalk registry placed in at initialisation."),
            data.get::<SourceManager>()
                .cloned()
                .expect("Streaming source placed in at initialisation."),
        )
    };

    if stalks.is_running(user_id) {
        check_msg(
            msg.channel_id
                .say(&ctx.http, "Mirroring is already running for you! Use !stopstalk to stop.")
                .await,
        );
        return Ok(());
    }

    info!("STALK - invoked by user {user_id} in guild {}", guild_id.0);

    let token = source.access_token(user_id).await?;
    if token.is_none() {
        check_msg(
            msg.channel_id
                .say(
                    &ctx.http,
                    "No linked streaming account found for you. Authorize the bot first, then try again.",
                )
                .await,
        );
        return Ok(());
    }

    let player = guild_player(ctx, guild_id).await;

    // The loop reports through this channel so it never has to know about
    // Discord.
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<String>();
    let http = ctx.http.clone();
    let channel_id = msg.channel_id;
    tokio::spawn(async move {
        while let Some(notice) = notice_rx.recv().await {
            if let Err(why) = channel_id.say(&http, notice).await {
                info!("Error sending message: {why:?}");
            }
        }
    });

    match stalks.start(user_id, source, player, notice_tx) {
        Ok(()) => check_msg(
            msg.channel_id
                .say(&ctx.http, "Mirroring started! Use !stopstalk to stop.")
                .await,
        ),
        Err(error) => check_msg(msg.channel_id.say(&ctx.http, format!("{error}")).await),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stopstalk(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let user_id = msg.author.id.0;

    let stalks = {
        let data = ctx.data.read().await;
        data.get::<StalkManager>()
            .cloned()
            .expect("Stalk registry placed in at initialisation.")
    };

    if !stalks.stop(user_id) {
        check_msg(msg.channel_id.say(&ctx.http, "No mirroring session is running for you.").await);
        return Ok(());
    }

    let player = guild_player(ctx, guild_id).await;
    let stopped = {
        let mut player = player.lock().await;
        if player.is_connected() {
            player.stop().await
        } else {
            Ok(())
        }
    };
    if stopped.is_ok() {
        leave_current_channel(ctx, msg).await?;
    }

    check_msg(msg.channel_id.say(&ctx.http, "Stopped mirroring.").await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn saveplaylist(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;
    let name = args.message().trim();

    if name.is_empty() {
        check_msg(msg.channel_id.say(&ctx.http, "Give the playlist a name.").await);
        return Ok(());
    }

    let store = playlist_store(ctx).await;
    let player = guild_player(ctx, guild_id).await;
    let tracks = {
        let player = player.lock().await;
        let mut tracks = Vec::new();
        if let Some(track) = player.now_playing() {
            tracks.push(track.clone());
        }
        tracks.extend(player.queue().iter().cloned());
        tracks
    };

    match store.save_playlist(msg.author.id.0, name, tracks).await {
        Ok(()) => check_msg(
            msg.channel_id
                .say(&ctx.http, format!("Playlist '{name}' saved (including current song)."))
                .await,
        ),
        Err(_) => check_msg(
            msg.channel_id
                .say(&ctx.http, "No songs to save in the playlist.")
                .await,
        ),
    }

    Ok(())
}

#[command("playlists")]
#[only_in(guilds)]
async fn playlists_list(ctx: &Context, msg: &Message) -> CommandResult {
    let store = playlist_store(ctx).await;
    let names = store.playlist_names(msg.author.id.0).await;

    if names.is_empty() {
        check_msg(msg.channel_id.say(&ctx.http, "You have no saved playlists.").await);
    } else {
        let listing: Vec<String> = names.iter().map(|name| format!("- {name}")).collect();
        check_msg(
            msg.channel_id
                .say(&ctx.http, format!("**Your playlists:**\n{}", listing.join("\n")))
                .await,
        );
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn loadplaylist(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let name = args.message().trim().to_string();

    if name.is_empty() {
        check_msg(msg.channel_id.say(&ctx.http, "Which playlist should I load?").await);
        return Ok(());
    }

    let store = playlist_store(ctx).await;
    let tracks = match store.get(msg.author.id.0, &name).await {
        Some(tracks) => tracks,
        None => {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, format!("No playlist named '{name}' found for you."))
                    .await,
            );
            return Ok(());
        }
    };

    ensure_connected(ctx, msg).await?;

    let guild_id = get_guild_id(ctx, msg)?;
    let count = tracks.len();
    let player = guild_player(ctx, guild_id).await;
    let started = {
        let mut player = player.lock().await;
        player.enqueue_all(tracks).await?
    };

    let mut reply = format!("Loaded playlist '{name}' ({count} tracks).");
    if let Some(track) = started {
        reply.push_str(&format!(" Playing **{}**.", track.title));
    }
    check_msg(msg.channel_id.say(&ctx.http, reply).await);

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn deleteplaylist(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let name = args.message().trim().to_string();

    let store = playlist_store(ctx).await;
    match store.delete(msg.author.id.0, &name).await? {
        true => check_msg(
            msg.channel_id
                .say(&ctx.http, format!("Deleted playlist '{name}'."))
                .await,
        ),
        false => check_msg(
            msg.channel_id
                .say(&ctx.http, format!("No playlist named '{name}' found for you."))
                .await,
        ),
    }

    Ok(())
}

/// Joins the caller's voice channel and binds a backend to the guild player
/// when it does not have one yet.
async fn ensure_connected(ctx: &Context, msg: &Message) -> Result<(), CommandError> {
    join(ctx, msg).await?;
    deafen(ctx, msg).await?;

    let guild_id = get_guild_id(ctx, msg)?;

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();
    let call = manager
        .get(guild_id)
        .ok_or_else(|| CommandError::from("Not in a voice channel to play in"))?;

    let track_end_tx = {
        let data = ctx.data.read().await;
        data.get::<TrackEndSender>()
            .cloned()
            .expect("Track end channel placed in at initialisation.")
    };

    let player = guild_player(ctx, guild_id).await;
    let mut player = player.lock().await;
    if !player.is_connected() {
        let session = player.begin_session();
        let volume = f32::from(player.volume_percent()) / 100.0;
        let backend = Arc::new(SongbirdBackend::new(
            guild_id.0,
            session,
            call,
            volume,
            track_end_tx,
        ));
        player.attach_backend(backend);
        if let Err(error) = player.sync_backend_volume().await {
            info!("Could not apply volume on connect: {error}");
        }
    }

    Ok(())
}

async fn join(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let channel_id = get_guild(ctx, msg)?
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id);

    let connect_to = match channel_id {
        Some(channel) => channel,
        None => {
            check_msg(msg.reply(ctx, "Not in a voice channel").await);

            return Err(CommandError::from("Not in a voice channel"));
        }
    };

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    let _handler = manager.join(guild_id, connect_to).await;

    Ok(())
}

async fn deafen(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    let handler_lock = match manager.get(guild_id) {
        Some(handler) => handler,
        None => {
            check_msg(msg.reply(ctx, "Not in a voice channel").await);

            return Ok(());
        }
    };

    let mut handler = handler_lock.lock().await;

    if handler.is_deaf() {
        info!("Already deafen!")
    } else if let Err(e) = handler.deafen(true).await {
        info!("Deafen failed due to {e:?}")
    }

    Ok(())
}

async fn leave_current_channel(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    let has_handler = manager.get(guild_id).is_some();

    if has_handler {
        if let Err(e) = manager.remove(guild_id).await {
            check_msg(msg.channel_id.say(&ctx.http, format!("Failed: {e:?}")).await);
        }

        check_msg(msg.channel_id.say(&ctx.http, "Left voice channel").await);
    } else {
        check_msg(msg.reply(ctx, "Not in a voice channel").await);
    }

    Ok(())
}

async fn disconnect_and_reset(ctx: &Context, guild_id: GuildId) {
    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    if manager.get(guild_id).is_some() {
        if let Err(e) = manager.remove(guild_id).await {
            info!("Failed leaving channel: {e:?}");
        }
    }

    let player = guild_player(ctx, guild_id).await;
    player.lock().await.reset_after_disconnect();
}

fn listeners_in_channel(ctx: &Context, guild_id: GuildId, channel_id: u64, bot_id: u64) -> usize {
    ctx.cache
        .guild(guild_id)
        .map(|guild| {
            guild
                .voice_states
                .values()
                .filter(|state| {
                    state.channel_id.map(|c| c.0) == Some(channel_id) && state.user_id.0 != bot_id
                })
                .count()
        })
        .unwrap_or(0)
}

async fn guild_player(ctx: &Context, guild_id: GuildId) -> Arc<Mutex<Player>> {
    let registry = {
        let data = ctx.data.read().await;
        data.get::<PlayerManager>()
            .cloned()
            .expect("Player registry placed in at initialisation.")
    };

    registry.get(guild_id.0).await
}

async fn playlist_store(ctx: &Context) -> Arc<PlaylistStore> {
    let data = ctx.data.read().await;
    data.get::<PlaylistManager>()
        .cloned()
        .expect("Playlist store placed in at initialisation.")
}

fn is_playlist_url(query: &str) -> bool {
    query.starts_with("http") && (query.contains("&list=") || query.contains("?list="))
}

fn parse_on_off(args: &mut Args) -> Option<bool> {
    match args.single::<String>().ok()?.to_ascii_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

/// Checks that a message successfully sent; if not, then logs why to stdout.
fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}

fn get_guild(ctx: &Context, msg: &Message) -> CommandResult<Guild> {
    msg.guild(&ctx.cache).ok_or(CommandError::from("Guild not found"))
}

fn get_guild_id(ctx: &Context, msg: &Message) -> CommandResult<GuildId> {
    let guild_id = get_guild(ctx, msg)?.id;

    Ok(guild_id)
}
